// kernel/src/panic.rs

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    lumen::serial_println_raw!();
    lumen::serial_println_raw!("KERNEL PANIC");
    lumen::serial_println_raw!("========================================");
    if let Some(location) = info.location() {
        lumen::serial_println_raw!("  at {}:{}:{}", location.file(), location.line(), location.column());
    }
    lumen::serial_println_raw!("  {}", info.message());

    loop {
        x86_64::instructions::hlt();
    }
}
