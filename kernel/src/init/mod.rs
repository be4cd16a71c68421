// kernel/src/init/mod.rs
//
// Boot orchestration: console, memory, descriptor tables, the kernel
// object and its filesystems, init, then the timer and the idle loop.

pub mod devices;
pub mod memory;
pub mod processes;

use bootloader_api::config::Mapping;
use bootloader_api::{BootInfo, BootloaderConfig};
use spin::Once;
use x86_64::registers::control::Cr3;

use lumen::{serial_println, Kernel, KernelConfig};

use crate::{gdt, interrupts};

pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    // Keep every bootloader mapping out of the user half.
    config.mappings.dynamic_range_start = Some(0xffff_8000_0000_0000);
    config.kernel_stack_size = 128 * 1024;
    config
};

static KERNEL: Once<Kernel> = Once::new();

pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(k) => k,
        None => panic!("trap before the kernel was initialised"),
    }
}

pub fn boot(boot_info: &'static mut BootInfo) -> ! {
    devices::init_console();
    serial_println!("lumen {} booting", env!("CARGO_PKG_VERSION"));

    let phys_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map physical memory");
    let pool = memory::init(phys_offset, &boot_info.memory_regions);

    gdt::init();
    interrupts::init_idt();

    let config = KernelConfig::default();
    let hz = config.timer_hz;
    let kernel_root = Cr3::read().0.start_address().as_u64();
    let kernel = KERNEL.call_once(|| processes::build_kernel(pool, config, kernel_root));

    let ramdisk = boot_info.ramdisk_addr.into_option().map(|addr| unsafe {
        core::slice::from_raw_parts(addr as *const u8, boot_info.ramdisk_len as usize)
    });
    processes::start_init(kernel, ramdisk);

    interrupts::init_timer(hz);
    serial_println!("boot: entering idle loop");
    interrupts::idle_loop(kernel)
}
