// kernel/src/init/processes.rs
//
// The kernel object, its filesystem tree, and pid 1.

use alloc::sync::Arc;

use lumen::fs::devfs::DevFs;
use lumen::fs::ramfs::RamNode;
use lumen::memory::FramePool;
use lumen::{serial_println, Kernel, KernelConfig};

use crate::interrupts::entry;

const INIT_PATH: &str = "/sbin/init";

/// ramfs at `/`, devfs at `/dev`.
pub fn build_kernel(pool: Arc<FramePool>, config: KernelConfig, kernel_root: u64) -> Kernel {
    let kernel = Kernel::new(pool, RamNode::new_root(), config, Some(kernel_root), entry::task_entry as usize as u64);
    let vfs = kernel.vfs();
    for dir in ["/dev", "/sbin", "/tmp"] {
        if let Err(e) = vfs.mkdir("/", dir, 0o755) {
            serial_println!("boot: mkdir {} failed: {:?}", dir, e);
        }
    }
    if let Err(e) = vfs.mount("/dev", DevFs::new().root()) {
        serial_println!("boot: mounting devfs failed: {:?}", e);
    }
    kernel
}

/// Install the ramdisk as `/sbin/init` and start it.
pub fn start_init(kernel: &Kernel, ramdisk: Option<&[u8]>) {
    let Some(image) = ramdisk else {
        serial_println!("init: no ramdisk, nothing to run");
        return;
    };
    if let Err(e) = kernel.vfs().write_file(INIT_PATH, image, 0o755) {
        serial_println!("init: cannot install {}: {:?}", INIT_PATH, e);
        return;
    }
    match kernel.spawn(INIT_PATH, &["init"]) {
        Ok(pid) => serial_println!("init: {} running as pid {} ({} bytes)", INIT_PATH, pid, image.len()),
        Err(e) => serial_println!("init: cannot start {}: {:?}", INIT_PATH, e),
    }
}
