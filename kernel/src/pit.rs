// kernel/src/pit.rs
//
// 8253/8254 channel 0 as the scheduler tick.

use x86_64::instructions::port::Port;

const PIT_CHANNEL_0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_BASE_HZ: u32 = 1_193_182;

/// Channel 0, lobyte/hibyte, mode 2 (rate generator).
const MODE_RATE_GENERATOR: u8 = 0x34;

pub fn init(frequency: u32) {
    let divisor = (PIT_BASE_HZ / frequency.max(19)).min(u16::MAX as u32) as u16;
    let mut command = Port::<u8>::new(PIT_COMMAND);
    let mut data = Port::<u8>::new(PIT_CHANNEL_0_DATA);
    unsafe {
        command.write(MODE_RATE_GENERATOR);
        data.write(divisor as u8);
        data.write((divisor >> 8) as u8);
    }
    lumen::serial_println!("pit: {} Hz (divisor {})", PIT_BASE_HZ / divisor as u32, divisor);
}
