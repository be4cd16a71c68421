// kernel/src/memory/address_space.rs
//
// AddressSpace: one process's page table + VMA list + heap/stack/mmap
// bookkeeping.  Created for a new process or by exec, duplicated
// copy-on-write by fork, torn down when dropped (the page table releases
// every frame it still references).

use alloc::sync::Arc;

use super::fault::FaultError;
use super::frame::{FramePool, PhysFrame};
use super::layout::{MMAP_BASE, USER_LIMIT, USER_MIN, USER_STACK_TOP};
use super::page_table::PageTable;
use super::vma::{Vma, VmaBacking, VmaFlags, VmaList};
use super::{checked_page_align_up, is_page_aligned, page_align_down, page_align_up, MmError, MmResult, PAGE_SIZE};
use crate::arch::{self, PtePerms};
use crate::config::KernelConfig;

/// End of `[start, start + len)` rounded up to a page, or `InvalidRange`
/// if it does not fit in the address space.
fn span_end(start: u64, len: u64) -> MmResult<u64> {
    checked_page_align_up(len)
        .and_then(|len| start.checked_add(len))
        .ok_or(MmError::InvalidRange)
}

pub struct AddressSpace {
    page_table: PageTable,
    vmas: VmaList,
    /// Kernel root whose upper half is shared into every table (x86).
    kernel_root: Option<u64>,
    heap_start: u64,
    brk: u64,
    stack_top: u64,
    /// Lowest address the stack may ever grow down to.
    stack_limit: u64,
    mmap_hint: u64,
}

unsafe impl Send for AddressSpace {}

impl AddressSpace {
    // ====================================================================
    // CONSTRUCTORS
    // ====================================================================

    /// Fresh user address space: zeroed root table and a single VMA for
    /// the downward-growing stack ending at `USER_STACK_TOP`.
    pub fn new_user(pool: Arc<FramePool>, kernel_root: Option<u64>, cfg: &KernelConfig) -> MmResult<Self> {
        let mut page_table = PageTable::new(pool)?;
        if let Some(root) = kernel_root {
            page_table.share_kernel_half(root);
        }
        let stack_top = USER_STACK_TOP;
        let stack_start = stack_top - cfg.stack_initial_pages as u64 * PAGE_SIZE;
        let mut vmas = VmaList::new();
        vmas.insert(Vma::anonymous(
            stack_start,
            stack_top,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::GROWS_DOWN,
        ))?;
        Ok(Self {
            page_table,
            vmas,
            kernel_root,
            heap_start: 0,
            brk: 0,
            stack_top,
            stack_limit: stack_top - cfg.stack_max_pages as u64 * PAGE_SIZE,
            mmap_hint: MMAP_BASE,
        })
    }

    /// Copy-on-write duplicate for fork.
    ///
    /// Every VMA is recreated in the child and every valid leaf copied.
    /// Pages of private writable VMAs become read-only + COW in *both*
    /// tables and their frames gain a reference; nothing is copied now.
    /// Shared mappings stay writable and simply gain a reference.
    pub fn duplicate(&mut self) -> MmResult<Self> {
        let pool = self.pool().clone();
        let mut child_pt = PageTable::new(pool.clone())?;
        if let Some(root) = self.kernel_root {
            child_pt.share_kernel_half(root);
        }
        let mut child_vmas = VmaList::new();
        let mut shared = 0usize;

        for vma in self.vmas.iter() {
            child_vmas.insert(vma.clone())?;
            let cow = vma.is_private_writable();
            for (va, pte) in self.page_table.valid_leaves(vma.start, vma.end) {
                let entry = if cow && (pte.is_writable() || pte.is_cow()) {
                    pte.with_writable(false).with_cow(true)
                } else {
                    pte
                };
                pool.inc_ref(PhysFrame::containing_address(pte.addr()));
                *child_pt.leaf_or_create(va)? = entry;
                if entry != pte {
                    self.page_table.set_leaf(va, entry)?;
                }
                shared += 1;
            }
        }

        crate::serial_trace!("mm: fork shared {} pages across {} VMAs", shared, child_vmas.len());

        Ok(Self {
            page_table: child_pt,
            vmas: child_vmas,
            kernel_root: self.kernel_root,
            heap_start: self.heap_start,
            brk: self.brk,
            stack_top: self.stack_top,
            stack_limit: self.stack_limit,
            mmap_hint: self.mmap_hint,
        })
    }

    // ====================================================================
    // ACCESSORS
    // ====================================================================

    pub fn pool(&self) -> &Arc<FramePool> {
        self.page_table.pool()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub fn vmas(&self) -> &VmaList {
        &self.vmas
    }

    pub fn find_vma(&self, addr: u64) -> Option<&Vma> {
        self.vmas.find(addr)
    }

    pub fn root_phys(&self) -> u64 {
        self.page_table.root().start_address()
    }

    pub fn stack_top(&self) -> u64 {
        self.stack_top
    }

    pub fn stack_limit(&self) -> u64 {
        self.stack_limit
    }

    pub fn brk_value(&self) -> u64 {
        self.brk
    }

    pub fn translate(&self, va: u64) -> Option<u64> {
        self.page_table.translate(va)
    }

    /// Number of pages currently backed by a frame.
    pub fn resident_pages(&self) -> usize {
        self.page_table.valid_leaves(0, USER_LIMIT).len()
    }

    /// Load this table into the MMU (TTBR0 / CR3).
    pub fn activate(&self) {
        arch::activate_root(self.root_phys());
    }

    // ====================================================================
    // VMA MANAGEMENT
    // ====================================================================

    pub fn insert_vma(&mut self, vma: Vma) -> MmResult<()> {
        if vma.start < USER_MIN || vma.end > USER_LIMIT {
            return Err(MmError::InvalidRange);
        }
        self.vmas.insert(vma)
    }

    /// Unmap `[start, start + len)`: shrink, split or drop the VMAs it
    /// touches and release every page mapped there.
    pub fn unmap(&mut self, start: u64, len: u64) -> MmResult<()> {
        if !is_page_aligned(start) || len == 0 {
            return Err(MmError::InvalidRange);
        }
        let end = span_end(start, len)?;
        if end > USER_LIMIT {
            return Err(MmError::InvalidRange);
        }
        for piece in self.vmas.remove_range(start, end) {
            self.page_table.unmap_range(piece.start, piece.end);
        }
        Ok(())
    }

    /// Create a mapping.  Without `fixed`, `addr` is only a hint and the
    /// first gap above the mmap base is used when it is unsuitable; with
    /// `fixed` whatever was mapped there is unmapped first.
    pub fn mmap(&mut self, addr: u64, len: u64, flags: VmaFlags, backing: VmaBacking, fixed: bool) -> MmResult<u64> {
        if len == 0 {
            return Err(MmError::InvalidRange);
        }
        let len = checked_page_align_up(len).ok_or(MmError::InvalidRange)?;
        if len > USER_LIMIT {
            return Err(MmError::InvalidRange);
        }
        let start = if fixed {
            if !is_page_aligned(addr) || addr < USER_MIN || addr.saturating_add(len) > USER_LIMIT {
                return Err(MmError::InvalidRange);
            }
            self.unmap(addr, len)?;
            addr
        } else {
            let hint = page_align_down(addr);
            if hint >= USER_MIN && hint.saturating_add(len) <= self.stack_limit && !self.vmas.overlaps(hint, hint + len) {
                hint
            } else {
                self.vmas
                    .find_gap(len, self.mmap_hint, self.stack_limit)
                    .or_else(|| self.vmas.find_gap(len, MMAP_BASE, self.stack_limit))
                    .ok_or(MmError::OutOfMemory)?
            }
        };
        self.vmas.insert(Vma::new(start, start + len, flags, backing))?;
        if !fixed && start >= MMAP_BASE {
            self.mmap_hint = start + len;
        }
        Ok(start)
    }

    /// Change protection of `[start, start + len)` and rewrite the leaves
    /// already present.  Pages still shared copy-on-write stay read-only.
    pub fn protect(&mut self, start: u64, len: u64, rwx: VmaFlags) -> MmResult<()> {
        if !is_page_aligned(start) || len == 0 {
            return Err(MmError::InvalidRange);
        }
        let end = span_end(start, len)?;
        if end > USER_LIMIT {
            return Err(MmError::InvalidRange);
        }
        self.vmas.protect_range(start, end, rwx)?;

        let pool = self.pool().clone();
        for (va, pte) in self.page_table.valid_leaves(start, end) {
            let Some(vma) = self.vmas.find(va) else { continue };
            let mut perms = vma.flags.pte_perms();
            let mut cow = pte.is_cow();
            let shared_file = matches!(vma.backing, VmaBacking::File { .. }) && vma.flags.contains(VmaFlags::SHARED);
            if shared_file && !pte.is_writable() {
                // the first store still has to fault to mark the page dirty
                perms.remove(PtePerms::WRITE);
            }
            if perms.contains(PtePerms::WRITE) && !vma.flags.contains(VmaFlags::SHARED) {
                let frame = PhysFrame::containing_address(pte.addr());
                if cow || (pool.owns(frame) && pool.ref_count(frame) > 1) {
                    perms.remove(PtePerms::WRITE);
                    cow = true;
                }
            }
            let entry = arch::PageTableEntry::new_page(pte.addr(), perms).with_cow(cow);
            self.page_table.set_leaf(va, entry)?;
        }
        Ok(())
    }

    // ====================================================================
    // HEAP & STACK
    // ====================================================================

    /// Start the heap at `addr` (just past the loaded image).
    pub fn set_heap_start(&mut self, addr: u64) {
        self.heap_start = page_align_up(addr);
        self.brk = self.heap_start;
    }

    /// Move the program break.  Returns the (possibly unchanged) break;
    /// `brk(0)` and refused requests just report the current one.
    pub fn brk(&mut self, new_brk: u64) -> u64 {
        if new_brk == 0 || new_brk < self.heap_start || self.heap_start == 0 {
            return self.brk;
        }
        let old_end = page_align_up(self.brk);
        let new_end = page_align_up(new_brk);
        if new_end > old_end {
            if new_end > self.stack_limit || self.vmas.overlaps(old_end, new_end) {
                return self.brk;
            }
            let heap = VmaFlags::READ | VmaFlags::WRITE;
            let extended = match self.vmas.find_mut(old_end - 1) {
                Some(v) if old_end > self.heap_start && v.end == old_end && v.start >= self.heap_start => {
                    v.end = new_end;
                    true
                }
                _ => false,
            };
            if !extended && self.vmas.insert(Vma::anonymous(old_end, new_end, heap)).is_err() {
                return self.brk;
            }
        } else if new_end < old_end && self.unmap(new_end, old_end - new_end).is_err() {
            return self.brk;
        }
        self.brk = new_brk;
        self.brk
    }

    /// Grow the stack VMA down to the page containing `addr`.  Pages are
    /// populated later by the ordinary fault path.
    pub fn expand_stack(&mut self, addr: u64) -> Result<(), FaultError> {
        let page = page_align_down(addr);
        let stack_start = self.vmas.stack().ok_or(FaultError::NoVma)?.start;
        if page >= stack_start {
            return Ok(());
        }
        if page < self.stack_limit {
            return Err(FaultError::StackOverflow);
        }
        if self.vmas.overlaps(page, stack_start) {
            return Err(FaultError::NoVma);
        }
        if let Some(stack) = self.vmas.stack_mut() {
            stack.start = page;
        }
        crate::serial_trace!("mm: stack grown to {:#x}", page);
        Ok(())
    }

    /// Is `addr` in the region the stack may still grow into?
    pub fn in_stack_growth_region(&self, addr: u64) -> bool {
        match self.vmas.stack() {
            Some(stack) => addr >= self.stack_limit && addr < stack.start,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(frames: usize) -> (Arc<FramePool>, AddressSpace) {
        let pool = FramePool::new_heap_backed(frames);
        let mm = AddressSpace::new_user(pool.clone(), None, &KernelConfig::default()).unwrap();
        (pool, mm)
    }

    fn rw() -> VmaFlags {
        VmaFlags::READ | VmaFlags::WRITE
    }

    fn populate(mm: &mut AddressSpace, va: u64, byte: u8) -> PhysFrame {
        let pool = mm.pool().clone();
        let f = pool.alloc_zeroed().unwrap();
        pool.write(f, 0, &[byte]);
        let perms = mm.find_vma(va).unwrap().flags.pte_perms();
        mm.page_table_mut().map(va, f, perms).unwrap();
        f
    }

    #[test]
    fn new_space_has_only_the_stack() {
        let (_pool, mm) = setup(16);
        let stack = mm.vmas().stack().unwrap();
        assert_eq!(stack.end, USER_STACK_TOP);
        assert_eq!(mm.vmas().len(), 1);
        assert_eq!(mm.resident_pages(), 0);
    }

    #[test]
    fn duplicate_marks_private_pages_cow_in_both() {
        let (pool, mut parent) = setup(64);
        parent.insert_vma(Vma::anonymous(0x1000, 0x3000, rw())).unwrap();
        let f = populate(&mut parent, 0x1000, 7);
        let child = parent.duplicate().unwrap();
        assert_eq!(pool.ref_count(f), 2);
        for mm in [&parent, &child] {
            let pte = mm.page_table().lookup(0x1000).unwrap();
            assert!(pte.is_cow() && !pte.is_writable());
            assert_eq!(pte.addr(), f.start_address());
        }
        drop(child);
        assert_eq!(pool.ref_count(f), 1);
    }

    #[test]
    fn shared_mappings_are_not_cow() {
        let (pool, mut parent) = setup(64);
        parent.insert_vma(Vma::anonymous(0x1000, 0x2000, rw() | VmaFlags::SHARED)).unwrap();
        let f = populate(&mut parent, 0x1000, 1);
        let child = parent.duplicate().unwrap();
        let pte = child.page_table().lookup(0x1000).unwrap();
        assert!(pte.is_writable() && !pte.is_cow());
        assert_eq!(pool.ref_count(f), 2);
    }

    #[test]
    fn unmap_middle_frees_exactly_the_gap() {
        let (pool, mut mm) = setup(64);
        mm.insert_vma(Vma::anonymous(0x10000, 0x14000, rw())).unwrap();
        for i in 0..4 {
            populate(&mut mm, 0x10000 + i * PAGE_SIZE, 0);
        }
        let before = pool.free_count();
        mm.unmap(0x11000, 0x2000).unwrap();
        assert_eq!(pool.free_count(), before + 2);
        let spans: alloc::vec::Vec<(u64, u64)> = mm.vmas().iter().filter(|v| v.start < 0x20000).map(|v| (v.start, v.end)).collect();
        assert_eq!(spans, [(0x10000, 0x11000), (0x13000, 0x14000)]);
        assert!(mm.translate(0x11000).is_none());
        assert!(mm.translate(0x13000).is_some());
    }

    #[test]
    fn lengths_near_the_top_of_the_address_space_are_invalid() {
        let (_pool, mut mm) = setup(16);
        let huge = u64::MAX - 10;
        assert_eq!(mm.mmap(0, huge, rw(), VmaBacking::Anonymous, false), Err(MmError::InvalidRange));
        assert_eq!(mm.mmap(MMAP_BASE, huge, rw(), VmaBacking::Anonymous, true), Err(MmError::InvalidRange));
        assert_eq!(mm.unmap(MMAP_BASE, huge), Err(MmError::InvalidRange));
        assert_eq!(mm.protect(MMAP_BASE, huge, VmaFlags::READ), Err(MmError::InvalidRange));
        assert_eq!(mm.unmap(u64::MAX & !(PAGE_SIZE - 1), PAGE_SIZE), Err(MmError::InvalidRange));
        assert_eq!(mm.vmas().len(), 1);
    }

    #[test]
    fn mmap_places_and_fixed_replaces() {
        let (_pool, mut mm) = setup(64);
        let a = mm.mmap(0, 8192, rw(), VmaBacking::Anonymous, false).unwrap();
        assert_eq!(a, MMAP_BASE);
        let b = mm.mmap(0, 100, rw(), VmaBacking::Anonymous, false).unwrap();
        assert_eq!(b, MMAP_BASE + 8192);
        assert_eq!(mm.mmap(0, 0, rw(), VmaBacking::Anonymous, false), Err(MmError::InvalidRange));
        let c = mm.mmap(a + 4096, 4096, VmaFlags::READ, VmaBacking::Anonymous, true).unwrap();
        assert_eq!(c, a + 4096);
        assert_eq!(mm.find_vma(a).unwrap().end, a + 4096);
        assert_eq!(mm.find_vma(c).unwrap().flags, VmaFlags::READ);
    }

    #[test]
    fn brk_grows_and_shrinks_one_vma() {
        let (_pool, mut mm) = setup(64);
        assert_eq!(mm.brk(0x50_0000), 0); // no heap yet
        mm.set_heap_start(0x40_0100);
        assert_eq!(mm.brk(0), 0x40_1000);
        assert_eq!(mm.brk(0x40_3000), 0x40_3000);
        assert_eq!(mm.brk(0x40_5800), 0x40_5800);
        let heap = mm.find_vma(0x40_1000).unwrap();
        assert_eq!((heap.start, heap.end), (0x40_1000, 0x40_6000));
        assert_eq!(mm.brk(0x40_2000), 0x40_2000);
        assert!(mm.find_vma(0x40_3000).is_none());
    }

    #[test]
    fn stack_growth_stops_at_the_limit() {
        let (_pool, mut mm) = setup(16);
        let start = mm.vmas().stack().unwrap().start;
        mm.expand_stack(start - 3 * PAGE_SIZE + 8).unwrap();
        assert_eq!(mm.vmas().stack().unwrap().start, start - 3 * PAGE_SIZE);
        let limit = mm.stack_limit();
        assert_eq!(mm.expand_stack(limit - 1), Err(FaultError::StackOverflow));
    }

    #[test]
    fn protect_keeps_shared_frames_read_only() {
        let (_pool, mut parent) = setup(64);
        parent.insert_vma(Vma::anonymous(0x1000, 0x2000, VmaFlags::READ)).unwrap();
        populate(&mut parent, 0x1000, 0);
        let _child = parent.duplicate().unwrap();
        parent.protect(0x1000, 0x1000, rw()).unwrap();
        let pte = parent.page_table().lookup(0x1000).unwrap();
        assert!(!pte.is_writable() && pte.is_cow());
    }

    #[test]
    fn drop_releases_everything() {
        let pool = FramePool::new_heap_backed(64);
        let before = pool.free_count();
        {
            let mut mm = AddressSpace::new_user(pool.clone(), None, &KernelConfig::default()).unwrap();
            mm.insert_vma(Vma::anonymous(0x1000, 0x5000, rw())).unwrap();
            for i in 0..4 {
                populate(&mut mm, 0x1000 + i * PAGE_SIZE, 0);
            }
            let _child = mm.duplicate().unwrap();
        }
        assert_eq!(pool.free_count(), before);
    }
}
