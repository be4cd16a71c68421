// kernel/src/init/devices.rs
//
// COM1 console sink.

use x86_64::instructions::port::Port;

use lumen::serial::{self, ConsoleSink};

const COM1: u16 = 0x3F8;
const LINE_STATUS: u16 = COM1 + 5;
const THR_EMPTY: u8 = 1 << 5;

struct Com1;

impl ConsoleSink for Com1 {
    fn write_bytes(&self, bytes: &[u8]) {
        let mut data = Port::<u8>::new(COM1);
        let mut status = Port::<u8>::new(LINE_STATUS);
        for &b in bytes {
            unsafe {
                while status.read() & THR_EMPTY == 0 {
                    core::hint::spin_loop();
                }
                data.write(b);
            }
        }
    }
}

static CONSOLE: Com1 = Com1;

pub fn init_console() {
    serial::set_sink(&CONSOLE);
}
