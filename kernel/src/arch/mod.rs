// kernel/src/arch/mod.rs
//
// Machine layer.  Both page-table encodings and trapframe layouts are always
// compiled (and unit-tested); `current` is the one the build target runs.
// Privileged instructions only exist for bare-metal builds; hosted builds
// get shims that count TLB invalidations and remember the active root.

use bitflags::bitflags;

pub mod arm64;
pub mod x86;

#[cfg(target_arch = "aarch64")]
pub use arm64 as current;
#[cfg(not(target_arch = "aarch64"))]
pub use x86 as current;

pub use current::{Context, PageTableEntry, TrapFrame};

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub use arm64::cpu::*;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use x86::cpu::*;

#[cfg(not(target_os = "none"))]
mod host;
#[cfg(not(target_os = "none"))]
pub use host::*;

bitflags! {
    /// Architecture-neutral leaf permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtePerms: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

/// Entries per table at every level of the 4-level, 4 KiB-granule tree.
pub const ENTRIES_PER_TABLE: usize = 512;
