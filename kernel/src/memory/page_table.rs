// kernel/src/memory/page_table.rs
//
// Walker for the 4-level, 4 KiB-granule translation tree.  Table frames
// come from the frame pool and are edited through its direct map, so a
// table can be built and inspected without being the active one.
//
// Ownership: every valid leaf holds one reference on its frame.  Clearing
// a leaf (unmap) or dropping the whole table releases those references,
// then the intermediate tables and the root.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::frame::{FramePool, PhysFrame};
use super::layout::USER_LIMIT;
use super::{MmError, MmResult, PAGE_SIZE};
use crate::arch::{self, PageTableEntry, PtePerms, ENTRIES_PER_TABLE};

const LEVELS: usize = 4;
const LEVEL_SHIFTS: [u64; LEVELS] = [39, 30, 21, 12];

#[inline]
fn index(va: u64, level: usize) -> usize {
    ((va >> LEVEL_SHIFTS[level]) & 0x1ff) as usize
}

/// Top-level slots covering user space.
const USER_ROOT_ENTRIES: usize = (USER_LIMIT >> 39) as usize;

pub struct PageTable {
    root: PhysFrame,
    pool: Arc<FramePool>,
}

unsafe impl Send for PageTable {}

impl PageTable {
    pub fn new(pool: Arc<FramePool>) -> MmResult<Self> {
        let root = pool.alloc_zeroed().ok_or(MmError::OutOfMemory)?;
        Ok(Self { root, pool })
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// View of the 512 entries of the table at `phys`.
    ///
    /// # Safety
    /// `phys` must be a table frame reachable through the pool's map.
    #[allow(clippy::mut_from_ref)]
    unsafe fn entries(&self, phys: u64) -> &mut [PageTableEntry; ENTRIES_PER_TABLE] {
        &mut *(self.pool.phys_to_virt(phys) as *mut [PageTableEntry; ENTRIES_PER_TABLE])
    }

    /// Copy the kernel's upper-half root entries from `template_root`, so
    /// the kernel stays mapped while this table is live.  The lower-level
    /// tables are shared, not owned.
    pub fn share_kernel_half(&mut self, template_root: u64) {
        unsafe {
            let src = &*(self.pool.phys_to_virt(template_root) as *const [PageTableEntry; ENTRIES_PER_TABLE]);
            let dst = self.entries(self.root.start_address());
            dst[USER_ROOT_ENTRIES..].copy_from_slice(&src[USER_ROOT_ENTRIES..]);
        }
    }

    /// Existing leaf slot for `va`, without allocating.
    fn leaf_slot(&self, va: u64) -> Option<*mut PageTableEntry> {
        let mut table = self.root.start_address();
        for level in 0..LEVELS - 1 {
            let entry = unsafe { self.entries(table)[index(va, level)] };
            if !entry.is_table() {
                return None;
            }
            table = entry.addr();
        }
        Some(unsafe { &mut self.entries(table)[index(va, LEVELS - 1)] as *mut _ })
    }

    /// Current leaf entry for `va` (may be invalid), if the intermediate
    /// tables exist.
    pub fn lookup(&self, va: u64) -> Option<PageTableEntry> {
        self.leaf_slot(va).map(|slot| unsafe { *slot })
    }

    /// Existing leaf slot for `va`.
    pub fn leaf_mut(&mut self, va: u64) -> Option<&mut PageTableEntry> {
        self.leaf_slot(va).map(|slot| unsafe { &mut *slot })
    }

    /// Leaf slot for `va`, allocating zeroed intermediate tables on the way.
    pub fn leaf_or_create(&mut self, va: u64) -> MmResult<&mut PageTableEntry> {
        let mut table = self.root.start_address();
        for level in 0..LEVELS - 1 {
            let slot = unsafe { &mut self.entries(table)[index(va, level)] };
            if !slot.is_valid() {
                let frame = self.pool.alloc_zeroed().ok_or(MmError::OutOfMemory)?;
                *slot = PageTableEntry::new_table(frame.start_address());
            }
            table = slot.addr();
        }
        Ok(unsafe { &mut self.entries(table)[index(va, LEVELS - 1)] })
    }

    /// Install `frame` at `va`.  The caller's reference on `frame` moves
    /// into the table.
    pub fn map(&mut self, va: u64, frame: PhysFrame, perms: PtePerms) -> MmResult<()> {
        let slot = self.leaf_or_create(va)?;
        if slot.is_valid() {
            return Err(MmError::AlreadyMapped);
        }
        *slot = PageTableEntry::new_page(frame.start_address(), perms);
        arch::flush_tlb_page(va);
        Ok(())
    }

    /// Replace the leaf at `va` (which must exist) and invalidate it.
    pub fn set_leaf(&mut self, va: u64, pte: PageTableEntry) -> MmResult<()> {
        let slot = self.leaf_mut(va).ok_or(MmError::NotMapped)?;
        *slot = pte;
        arch::flush_tlb_page(va);
        Ok(())
    }

    /// Clear the leaf at `va` and drop its frame reference.
    pub fn unmap(&mut self, va: u64) -> Option<PhysFrame> {
        let slot = self.leaf_mut(va)?;
        if !slot.is_valid() {
            return None;
        }
        let frame = PhysFrame::containing_address(slot.addr());
        *slot = PageTableEntry::empty();
        arch::flush_tlb_page(va);
        self.pool.free_frame(frame);
        Some(frame)
    }

    /// Unmap every valid leaf in `[start, end)`; returns how many.
    pub fn unmap_range(&mut self, start: u64, end: u64) -> usize {
        let leaves = self.valid_leaves(start, end);
        for &(va, _) in &leaves {
            self.unmap(va);
        }
        leaves.len()
    }

    pub fn translate(&self, va: u64) -> Option<u64> {
        let pte = self.lookup(va)?;
        pte.is_valid().then(|| pte.addr() + (va & (PAGE_SIZE - 1)))
    }

    /// All valid leaves inside `[start, end)`, skipping absent subtrees.
    pub fn valid_leaves(&self, start: u64, end: u64) -> Vec<(u64, PageTableEntry)> {
        let mut out = Vec::new();
        self.collect(self.root.start_address(), 0, 0, start, end.min(USER_LIMIT), &mut out);
        out
    }

    fn collect(&self, table: u64, level: usize, base: u64, start: u64, end: u64, out: &mut Vec<(u64, PageTableEntry)>) {
        let span = 1u64 << LEVEL_SHIFTS[level];
        let entries = unsafe { self.entries(table) };
        for (i, entry) in entries.iter().enumerate() {
            let lo = base + i as u64 * span;
            if lo >= end || lo.saturating_add(span) <= start {
                continue;
            }
            if level == LEVELS - 1 {
                if entry.is_valid() {
                    out.push((lo, *entry));
                }
            } else if entry.is_table() {
                self.collect(entry.addr(), level + 1, lo, start, end, out);
            }
        }
    }

    fn free_subtree(&self, table: u64, level: usize, limit: usize) {
        let entries = unsafe { self.entries(table) };
        for entry in entries.iter_mut().take(limit) {
            if level == LEVELS - 1 {
                if entry.is_valid() {
                    self.pool.free_frame(PhysFrame::containing_address(entry.addr()));
                }
            } else if entry.is_table() {
                self.free_subtree(entry.addr(), level + 1, ENTRIES_PER_TABLE);
                self.pool.free_frame(PhysFrame::containing_address(entry.addr()));
            }
            *entry = PageTableEntry::empty();
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        // Only the user half is ours; shared kernel entries are left alone.
        self.free_subtree(self.root.start_address(), 0, USER_ROOT_ENTRIES);
        self.pool.free_frame(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_user() -> PtePerms {
        PtePerms::READ | PtePerms::WRITE | PtePerms::USER
    }

    #[test]
    fn map_translate_unmap() {
        let pool = FramePool::new_heap_backed(16);
        let mut pt = PageTable::new(pool.clone()).unwrap();
        let frame = pool.alloc_zeroed().unwrap();
        pt.map(0x40_1000, frame, rw_user()).unwrap();
        assert_eq!(pt.translate(0x40_1234), Some(frame.start_address() + 0x234));
        assert_eq!(pt.map(0x40_1000, frame, rw_user()), Err(MmError::AlreadyMapped));
        assert_eq!(pt.unmap(0x40_1000), Some(frame));
        assert_eq!(pt.translate(0x40_1000), None);
        assert_eq!(pool.ref_count(frame), 0);
    }

    #[test]
    fn lookup_does_not_allocate() {
        let pool = FramePool::new_heap_backed(8);
        let pt = PageTable::new(pool.clone()).unwrap();
        let free = pool.free_count();
        assert!(pt.lookup(0x7fff_0000_0000).is_none());
        assert_eq!(pool.free_count(), free);
    }

    #[test]
    fn leaves_are_listed_in_order() {
        let pool = FramePool::new_heap_backed(32);
        let mut pt = PageTable::new(pool.clone()).unwrap();
        for va in [0x3000u64, 0x1000, 0x20_0000] {
            let f = pool.alloc_zeroed().unwrap();
            pt.map(va, f, rw_user()).unwrap();
        }
        let vas: Vec<u64> = pt.valid_leaves(0, 0x10_0000).iter().map(|l| l.0).collect();
        assert_eq!(vas, [0x1000, 0x3000]);
        assert_eq!(pt.unmap_range(0, USER_LIMIT), 3);
    }

    #[test]
    fn drop_returns_every_frame() {
        let pool = FramePool::new_heap_backed(32);
        let before = pool.free_count();
        {
            let mut pt = PageTable::new(pool.clone()).unwrap();
            for i in 0..4u64 {
                let f = pool.alloc_zeroed().unwrap();
                pt.map(0x1000 + i * 0x20_0000, f, rw_user()).unwrap();
            }
        }
        assert_eq!(pool.free_count(), before);
    }

    #[test]
    fn leaf_updates_flush_the_tlb() {
        let pool = FramePool::new_heap_backed(8);
        let mut pt = PageTable::new(pool.clone()).unwrap();
        let f = pool.alloc_zeroed().unwrap();
        let before = arch::tlb_flush_count();
        pt.map(0x5000, f, rw_user()).unwrap();
        assert!(arch::tlb_flush_count() > before);
    }
}
