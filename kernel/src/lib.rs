// kernel/src/lib.rs
//
// Architecture-neutral kernel core: virtual memory (page tables, VMAs,
// faults, copy-on-write), the VFS with its page cache, processes, the
// scheduler, fork/exec and signal delivery.
//
// Everything privileged sits behind `arch`; on hosted targets those
// primitives are shims, so the whole core runs under `cargo test`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;

pub mod allocator;
pub mod arch;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod memory;
pub mod process;
pub mod sync;
pub mod syscall;

pub use config::KernelConfig;
pub use error::Errno;
pub use kernel::Kernel;
