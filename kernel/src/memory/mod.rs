// kernel/src/memory/mod.rs
//
// Virtual memory: the physical frame pool, the page-table walker, VMAs,
// per-process address spaces, fault resolution and the user-copy path.

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod page_table;
pub mod user_copy;
pub mod vma;

pub use address_space::AddressSpace;
pub use frame::{FramePool, PhysFrame};
pub use page_table::PageTable;
pub use vma::{Vma, VmaBacking, VmaFlags, VmaList};

pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u64 = 12;

/// Fixed user-space layout (lower half; identical on both architectures).
pub mod layout {
    /// First address that is no longer user space.
    pub const USER_LIMIT: u64 = 0x0000_8000_0000_0000;
    /// Nothing is ever mapped below this (null-pointer guard).
    pub const USER_MIN: u64 = 0x1000;
    /// Top of the initial user stack.
    pub const USER_STACK_TOP: u64 = 0x0000_7fff_ff00_0000;
    /// Read-only executable page holding the signal-return trampoline.
    pub const SIGNAL_TRAMPOLINE: u64 = 0x0000_7fff_ffff_0000;
    /// Where the search for unfixed mmap placements starts.
    pub const MMAP_BASE: u64 = 0x0000_7000_0000_0000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    OutOfMemory,
    /// The range collides with an existing VMA.
    Overlap,
    InvalidRange,
    NotMapped,
    AlreadyMapped,
    NoVma,
}

pub type MmResult<T> = Result<T, MmError>;

#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// `page_align_up` that reports overflow instead of wrapping.
#[inline]
pub const fn checked_page_align_up(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// Page-sized steps over `[start, end)`.
pub fn pages(start: u64, end: u64) -> impl Iterator<Item = u64> {
    (page_align_down(start)..end).step_by(PAGE_SIZE as usize)
}
