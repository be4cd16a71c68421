// kernel/src/memory/vma.rs
//
// Virtual Memory Areas: which virtual ranges of a process are valid, with
// what protection, and what backs them.  The fault handler uses them to
// tell a legitimate fault (populate the page) from an invalid one (signal
// the process).
//
// The list is kept sorted by start address and never overlaps.  VMA counts
// per process are small, so lookups are a linear scan.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use super::{MmError, MmResult, PAGE_SIZE, is_page_aligned};
use crate::arch::PtePerms;
use crate::fs::Inode;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const EXEC       = 1 << 2;
        /// Writes are visible to every mapper; never copy-on-write.
        const SHARED     = 1 << 3;
        /// The stack: may be extended downwards by faults.
        const GROWS_DOWN = 1 << 4;
    }
}

impl VmaFlags {
    /// Leaf permissions for a freshly populated page.
    pub fn pte_perms(self) -> PtePerms {
        let mut p = PtePerms::USER | PtePerms::READ;
        p.set(PtePerms::WRITE, self.contains(VmaFlags::WRITE));
        p.set(PtePerms::EXEC, self.contains(VmaFlags::EXEC));
        p
    }
}

/// What supplies the contents of a page on first touch.
#[derive(Clone)]
pub enum VmaBacking {
    /// Zero-filled on demand (stack, heap, anonymous mmap, ELF bss).
    Anonymous,
    /// Pages of `inode` starting at byte `offset` (page aligned).
    File { inode: Arc<Inode>, offset: u64 },
    /// Fixed physical range (device memory), mapped as is.
    Device { phys: u64 },
}

impl fmt::Debug for VmaBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmaBacking::Anonymous => write!(f, "anon"),
            VmaBacking::File { inode, offset } => write!(f, "file(ino {} +{:#x})", inode.id(), offset),
            VmaBacking::Device { phys } => write!(f, "dev({:#x})", phys),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
    pub backing: VmaBacking,
}

impl Vma {
    pub fn new(start: u64, end: u64, flags: VmaFlags, backing: VmaBacking) -> Self {
        Self { start, end, flags, backing }
    }

    pub fn anonymous(start: u64, end: u64, flags: VmaFlags) -> Self {
        Self::new(start, end, flags, VmaBacking::Anonymous)
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_private_writable(&self) -> bool {
        self.flags.contains(VmaFlags::WRITE) && !self.flags.contains(VmaFlags::SHARED)
    }

    /// The same mapping restricted to `[start, end)`; file offsets and
    /// device addresses shift along with the start.
    pub fn slice(&self, start: u64, end: u64) -> Self {
        let delta = start - self.start;
        let backing = match &self.backing {
            VmaBacking::Anonymous => VmaBacking::Anonymous,
            VmaBacking::File { inode, offset } => VmaBacking::File { inode: inode.clone(), offset: offset + delta },
            VmaBacking::Device { phys } => VmaBacking::Device { phys: phys + delta },
        };
        Self { start, end, flags: self.flags, backing }
    }
}

// ============================================================================
// Per-address-space list
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct VmaList {
    entries: Vec<Vma>,
}

impl VmaList {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Add a VMA.  Rejects empty or unaligned ranges and any overlap with
    /// an existing VMA.
    pub fn insert(&mut self, vma: Vma) -> MmResult<()> {
        if vma.start >= vma.end || !is_page_aligned(vma.start) || !is_page_aligned(vma.end) {
            return Err(MmError::InvalidRange);
        }
        if self.entries.iter().any(|v| v.overlaps(vma.start, vma.end)) {
            return Err(MmError::Overlap);
        }
        let pos = self.entries.partition_point(|v| v.start < vma.start);
        self.entries.insert(pos, vma);
        Ok(())
    }

    pub fn find(&self, addr: u64) -> Option<&Vma> {
        self.entries.iter().find(|v| v.contains(addr))
    }

    pub fn find_mut(&mut self, addr: u64) -> Option<&mut Vma> {
        self.entries.iter_mut().find(|v| v.contains(addr))
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.entries.iter().any(|v| v.overlaps(start, end))
    }

    /// The downward-growing stack VMA.
    pub fn stack(&self) -> Option<&Vma> {
        self.entries.iter().find(|v| v.flags.contains(VmaFlags::GROWS_DOWN))
    }

    pub fn stack_mut(&mut self) -> Option<&mut Vma> {
        self.entries.iter_mut().find(|v| v.flags.contains(VmaFlags::GROWS_DOWN))
    }

    /// Lowest gap of `len` bytes at or above `from`, ending at or below
    /// `limit`.  Walks the list in address order (first fit).
    pub fn find_gap(&self, len: u64, from: u64, limit: u64) -> Option<u64> {
        let mut candidate = from;
        for v in &self.entries {
            if v.end <= candidate {
                continue;
            }
            if v.start >= candidate && v.start - candidate >= len {
                break;
            }
            candidate = candidate.max(v.end);
        }
        (candidate.checked_add(len)? <= limit).then_some(candidate)
    }

    /// Remove `[start, end)` from every VMA it touches.  Each VMA falls in
    /// one of four cases: fully covered (removed), clipped at its low end
    /// (start raised), clipped at its high end (end lowered), or holed in
    /// the middle (split in two).  Returns the pieces that were removed.
    pub fn remove_range(&mut self, start: u64, end: u64) -> Vec<Vma> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let v = &self.entries[i];
            if !v.overlaps(start, end) {
                i += 1;
                continue;
            }
            let cut_lo = v.start.max(start);
            let cut_hi = v.end.min(end);
            removed.push(v.slice(cut_lo, cut_hi));

            match (start <= v.start, end >= v.end) {
                (true, true) => {
                    self.entries.remove(i);
                    continue;
                }
                (true, false) => {
                    let rest = v.slice(end, v.end);
                    self.entries[i] = rest;
                }
                (false, true) => {
                    self.entries[i].end = start;
                }
                (false, false) => {
                    let high = v.slice(end, v.end);
                    self.entries[i].end = start;
                    self.entries.insert(i + 1, high);
                    i += 1;
                }
            }
            i += 1;
        }
        removed
    }

    /// Change the protection of `[start, end)`, splitting VMAs at the
    /// boundaries.  Every page in the range must already be covered.
    pub fn protect_range(&mut self, start: u64, end: u64, rwx: VmaFlags) -> MmResult<()> {
        let mut covered = 0;
        for v in self.entries.iter().filter(|v| v.overlaps(start, end)) {
            covered += v.end.min(end) - v.start.max(start);
        }
        if covered != end - start {
            return Err(MmError::NoVma);
        }
        let pieces = self.remove_range(start, end);
        let mask = VmaFlags::READ | VmaFlags::WRITE | VmaFlags::EXEC;
        for mut piece in pieces {
            piece.flags = (piece.flags - mask) | (rwx & mask);
            self.insert(piece)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Debug: print all VMAs.
    pub fn dump(&self, label: usize) {
        crate::serial_println!("VMAs for PID {}:", label);
        for v in &self.entries {
            crate::serial_println!(
                "  {:#x}..{:#x} ({} pages) [{:?}] {:?}",
                v.start,
                v.end,
                v.len() / PAGE_SIZE,
                v.backing,
                v.flags,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw() -> VmaFlags {
        VmaFlags::READ | VmaFlags::WRITE
    }

    fn ranges(list: &VmaList) -> Vec<(u64, u64)> {
        list.iter().map(|v| (v.start, v.end)).collect()
    }

    fn assert_disjoint(list: &VmaList) {
        let v: Vec<&Vma> = list.iter().collect();
        for (i, a) in v.iter().enumerate() {
            for b in &v[i + 1..] {
                assert!(!(a.start < b.end && b.start < a.end), "{:?} overlaps {:?}", a, b);
            }
        }
        assert!(v.windows(2).all(|w| w[0].start < w[1].start));
    }

    #[test]
    fn insert_keeps_order_and_rejects_overlap() {
        let mut l = VmaList::new();
        l.insert(Vma::anonymous(0x5000, 0x6000, rw())).unwrap();
        l.insert(Vma::anonymous(0x1000, 0x3000, rw())).unwrap();
        assert_eq!(l.insert(Vma::anonymous(0x2000, 0x5000, rw())), Err(MmError::Overlap));
        assert_eq!(l.insert(Vma::anonymous(0x3000, 0x3000, rw())), Err(MmError::InvalidRange));
        l.insert(Vma::anonymous(0x3000, 0x5000, rw())).unwrap();
        assert_eq!(ranges(&l), [(0x1000, 0x3000), (0x3000, 0x5000), (0x5000, 0x6000)]);
        assert_eq!(l.find(0x4fff).map(|v| v.start), Some(0x3000));
        assert!(l.find(0x6000).is_none());
    }

    #[test]
    fn unmap_four_cases() {
        let mut l = VmaList::new();
        l.insert(Vma::anonymous(0x1000, 0x2000, rw())).unwrap(); // contained
        l.insert(Vma::anonymous(0x10000, 0x14000, rw())).unwrap(); // split
        l.insert(Vma::anonymous(0x20000, 0x24000, rw())).unwrap(); // low end clipped
        l.insert(Vma::anonymous(0x30000, 0x34000, rw())).unwrap(); // high end clipped

        l.remove_range(0x1000, 0x2000);
        let removed = l.remove_range(0x11000, 0x12000);
        assert_eq!(removed.len(), 1);
        assert_eq!((removed[0].start, removed[0].end), (0x11000, 0x12000));
        l.remove_range(0x1f000, 0x21000);
        l.remove_range(0x33000, 0x40000);

        assert_eq!(
            ranges(&l),
            [(0x10000, 0x11000), (0x12000, 0x14000), (0x21000, 0x24000), (0x30000, 0x33000)]
        );
        assert_disjoint(&l);
    }

    #[test]
    fn split_preserves_file_offsets() {
        let mut l = VmaList::new();
        l.insert(Vma::new(0x10000, 0x14000, rw(), VmaBacking::Device { phys: 0xfe00_0000 })).unwrap();
        l.remove_range(0x11000, 0x12000);
        match l.find(0x12000).map(|v| &v.backing) {
            Some(VmaBacking::Device { phys }) => assert_eq!(*phys, 0xfe00_2000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn gap_search_is_first_fit() {
        let mut l = VmaList::new();
        l.insert(Vma::anonymous(0x10000, 0x12000, rw())).unwrap();
        l.insert(Vma::anonymous(0x13000, 0x20000, rw())).unwrap();
        assert_eq!(l.find_gap(0x1000, 0x10000, 0x100000), Some(0x12000));
        assert_eq!(l.find_gap(0x2000, 0x10000, 0x100000), Some(0x20000));
        assert_eq!(l.find_gap(0x2000, 0x10000, 0x21000), None);
    }

    #[test]
    fn protect_splits_at_boundaries() {
        let mut l = VmaList::new();
        l.insert(Vma::anonymous(0x1000, 0x5000, rw())).unwrap();
        l.protect_range(0x2000, 0x3000, VmaFlags::READ).unwrap();
        assert_eq!(ranges(&l), [(0x1000, 0x2000), (0x2000, 0x3000), (0x3000, 0x5000)]);
        assert_eq!(l.find(0x2000).unwrap().flags, VmaFlags::READ);
        assert_eq!(l.protect_range(0x4000, 0x6000, VmaFlags::READ), Err(MmError::NoVma));
    }

    #[test]
    fn random_insert_unmap_never_overlaps() {
        // xorshift keeps the sequence deterministic
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        let mut l = VmaList::new();
        for _ in 0..500 {
            let a = (next() % 64) * PAGE_SIZE;
            let b = a + (1 + next() % 8) * PAGE_SIZE;
            if next() % 3 == 0 {
                l.remove_range(a, b);
            } else {
                let _ = l.insert(Vma::anonymous(a, b, rw()));
            }
            assert_disjoint(&l);
        }
    }
}
