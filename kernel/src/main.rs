// kernel/src/main.rs
//
// x86_64 boot image for the `lumen` kernel core: boot entry, heap, GDT/TSS,
// IDT and trap stubs, PIC/PIT, and pid 1 from the bootloader ramdisk.
//
// Build for `x86_64-unknown-none`; on hosted targets this is an empty
// program so that `cargo test` only exercises the library.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod gdt;
#[cfg(target_os = "none")]
mod init;
#[cfg(target_os = "none")]
mod interrupts;
#[cfg(target_os = "none")]
mod panic;
#[cfg(target_os = "none")]
mod pit;

#[cfg(target_os = "none")]
bootloader_api::entry_point!(init::boot, config = &init::BOOTLOADER_CONFIG);

#[cfg(not(target_os = "none"))]
fn main() {}
