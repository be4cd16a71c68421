// kernel/src/drivers/mod.rs
//
// Character device drivers.
//
// Each driver is an `InodeOps` implementation; devfs builds one inode per
// entry of `DEVICES`.  Adding a device = add a module + one line below.

pub mod dev_null;
pub mod dev_zero;
pub mod serial_console;

use alloc::sync::Arc;

use crate::fs::InodeOps;

pub struct DeviceEntry {
    /// Name under /dev.
    pub name: &'static str,
    pub perm: u32,
    pub ops: fn() -> Arc<dyn InodeOps>,
}

pub static DEVICES: &[DeviceEntry] = &[
    DeviceEntry { name: "null",    perm: 0o666, ops: dev_null::ops },
    DeviceEntry { name: "zero",    perm: 0o666, ops: dev_zero::ops },
    DeviceEntry { name: "console", perm: 0o620, ops: serial_console::ops },
];
