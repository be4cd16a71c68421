// kernel/src/memory/fault.rs
//
// Page fault resolution.
//
// Flow:
//   1. No VMA covers the address → stack growth if it is in the region
//      below the stack VMA, otherwise fail.
//   2. Access not allowed by the VMA → protection failure.
//   3. Leaf not valid → demand population (zero page, file page, device).
//   4. Leaf valid + COW + write → private copy (or take the frame over if
//      no one else references it any more).
//   5. Leaf valid + write to a read-only page of a writable shared file
//      mapping → tell the pager the page is dirty, then allow writes.
//   6. Anything else → failure; the caller raises SIGSEGV (or, on the
//      user-copy path, returns EFAULT).

use alloc::sync::Arc;

use super::address_space::AddressSpace;
use super::frame::PhysFrame;
use super::layout::USER_LIMIT;
use super::vma::{VmaBacking, VmaFlags};
use super::page_align_down;
use crate::arch::{self, PageTableEntry, PtePerms};
use crate::fs::Inode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No VMA covers the address.
    NoVma,
    /// Growth past the stack's hard limit.
    StackOverflow,
    /// The mapping does not allow this access.
    Protection,
    OutOfMemory,
    /// The backing file could not be read.
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A first-touch page was installed.
    Populated,
    /// A shared COW frame was copied.
    CopiedOnWrite,
    /// A COW frame with no other holder was made writable in place.
    Reused,
    /// First write to a shared file page: marked dirty and made writable.
    Dirtied,
    /// The entry already allowed the access (stale TLB entry).
    Spurious,
}

/// Supplies file pages to the fault handler (the page cache, in practice).
pub trait FilePager {
    /// The cached frame holding `inode`'s page at `offset` (page aligned),
    /// with one extra reference owned by the caller.
    fn file_page(&self, inode: &Arc<Inode>, offset: u64) -> Result<PhysFrame, FaultError>;

    /// A shared mapping is about to store into the page at `offset`.
    fn mark_dirty(&self, _inode: &Arc<Inode>, _offset: u64) {}
}

/// Pager for contexts with no file-backed mappings.
pub struct NoPager;

impl FilePager for NoPager {
    fn file_page(&self, _inode: &Arc<Inode>, _offset: u64) -> Result<PhysFrame, FaultError> {
        Err(FaultError::Io)
    }
}

/// Resolve a fault at `addr` in `mm`.
pub fn handle_fault(
    mm: &mut AddressSpace,
    pager: &dyn FilePager,
    addr: u64,
    access: Access,
) -> Result<Resolution, FaultError> {
    if addr >= USER_LIMIT {
        return Err(FaultError::NoVma);
    }

    // ── 1. VMA lookup, stack growth ───────────────────────────────────

    if mm.find_vma(addr).is_none() {
        if !mm.in_stack_growth_region(addr) {
            return Err(FaultError::NoVma);
        }
        mm.expand_stack(addr)?;
    }
    let vma = mm.find_vma(addr).ok_or(FaultError::NoVma)?.clone();

    // ── 2. Permission check against the VMA ───────────────────────────

    let allowed = match access {
        Access::Read => vma.flags.intersects(VmaFlags::READ | VmaFlags::WRITE | VmaFlags::EXEC),
        Access::Write => vma.flags.contains(VmaFlags::WRITE),
        Access::Execute => vma.flags.contains(VmaFlags::EXEC),
    };
    if !allowed {
        return Err(FaultError::Protection);
    }

    let pool = mm.pool().clone();
    let va = page_align_down(addr);
    let pte = *mm.page_table_mut().leaf_or_create(va).map_err(|_| FaultError::OutOfMemory)?;

    // ── 3. Demand population ──────────────────────────────────────────

    if !pte.is_valid() {
        let mut perms = vma.flags.pte_perms();
        let frame = match &vma.backing {
            VmaBacking::Anonymous => pool.alloc_zeroed().ok_or(FaultError::OutOfMemory)?,
            VmaBacking::File { inode, offset } => {
                let file_off = offset + (va - vma.start);
                let cached = pager.file_page(inode, file_off)?;
                if vma.flags.contains(VmaFlags::SHARED) {
                    // writable only once the page is known to be dirty
                    if access == Access::Write {
                        pager.mark_dirty(inode, file_off);
                    } else {
                        perms.remove(PtePerms::WRITE);
                    }
                    cached
                } else {
                    let private = pool.alloc_frame();
                    if let Some(private) = private {
                        pool.copy_frame(private, cached);
                    }
                    pool.free_frame(cached);
                    private.ok_or(FaultError::OutOfMemory)?
                }
            }
            VmaBacking::Device { phys } => PhysFrame::containing_address(phys + (va - vma.start)),
        };
        let slot = mm.page_table_mut().leaf_mut(va).ok_or(FaultError::OutOfMemory)?;
        *slot = PageTableEntry::new_page(frame.start_address(), perms);
        arch::flush_tlb_page(va);
        crate::serial_trace!("fault: {:#x} populated with {:#x}", va, frame.start_address());
        return Ok(Resolution::Populated);
    }

    // ── 4. Copy-on-write ──────────────────────────────────────────────

    if access == Access::Write && pte.is_cow() {
        let old = PhysFrame::containing_address(pte.addr());
        let mut perms = pte.perms();
        perms.insert(PtePerms::WRITE);

        if pool.ref_count(old) <= 1 {
            let entry = pte.with_writable(true).with_cow(false);
            mm.page_table_mut().set_leaf(va, entry).map_err(|_| FaultError::NoVma)?;
            return Ok(Resolution::Reused);
        }

        let new = pool.alloc_frame().ok_or(FaultError::OutOfMemory)?;
        pool.copy_frame(new, old);
        mm.page_table_mut()
            .set_leaf(va, PageTableEntry::new_page(new.start_address(), perms))
            .map_err(|_| FaultError::NoVma)?;
        pool.free_frame(old);
        crate::serial_trace!("fault: COW {:#x} {:#x} -> {:#x}", va, old.start_address(), new.start_address());
        return Ok(Resolution::CopiedOnWrite);
    }

    // ── 5. First store to a clean shared file page ────────────────────

    if access == Access::Write && !pte.is_writable() && vma.flags.contains(VmaFlags::WRITE | VmaFlags::SHARED) {
        if let VmaBacking::File { inode, offset } = &vma.backing {
            pager.mark_dirty(inode, offset + (va - vma.start));
            mm.page_table_mut().set_leaf(va, pte.with_writable(true)).map_err(|_| FaultError::NoVma)?;
            return Ok(Resolution::Dirtied);
        }
    }

    // ── 6. Already allowed, or a real violation ───────────────────────

    let ok = match access {
        Access::Read => true,
        Access::Write => pte.is_writable(),
        Access::Execute => pte.is_executable(),
    };
    if ok {
        arch::flush_tlb_page(va);
        Ok(Resolution::Spurious)
    } else {
        Err(FaultError::Protection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memory::frame::FramePool;
    use crate::memory::vma::Vma;
    use crate::memory::PAGE_SIZE;

    fn space(frames: usize) -> (Arc<FramePool>, AddressSpace) {
        let pool = FramePool::new_heap_backed(frames);
        let mm = AddressSpace::new_user(pool.clone(), None, &KernelConfig::default()).unwrap();
        (pool, mm)
    }

    #[test]
    fn first_touch_installs_zeroed_frame() {
        let (pool, mut mm) = space(32);
        mm.insert_vma(Vma::anonymous(0x1000, 0x3000, VmaFlags::READ | VmaFlags::WRITE)).unwrap();
        assert_eq!(handle_fault(&mut mm, &NoPager, 0x1010, Access::Write), Ok(Resolution::Populated));
        let pte = mm.page_table().lookup(0x1000).unwrap();
        assert!(pte.is_writable() && !pte.is_executable());
        let mut byte = [0xffu8; 1];
        pool.read(PhysFrame::containing_address(pte.addr()), 0x10, &mut byte);
        assert_eq!(byte, [0]);
    }

    #[test]
    fn read_only_vma_gets_read_only_page_and_rejects_writes() {
        let (_pool, mut mm) = space(32);
        mm.insert_vma(Vma::anonymous(0x1000, 0x2000, VmaFlags::READ)).unwrap();
        assert_eq!(handle_fault(&mut mm, &NoPager, 0x1000, Access::Write), Err(FaultError::Protection));
        handle_fault(&mut mm, &NoPager, 0x1000, Access::Read).unwrap();
        assert!(!mm.page_table().lookup(0x1000).unwrap().is_writable());
        assert_eq!(handle_fault(&mut mm, &NoPager, 0x1000, Access::Write), Err(FaultError::Protection));
    }

    #[test]
    fn unmapped_address_fails() {
        let (_pool, mut mm) = space(16);
        assert_eq!(handle_fault(&mut mm, &NoPager, 0x1234_0000, Access::Read), Err(FaultError::NoVma));
        assert_eq!(handle_fault(&mut mm, &NoPager, USER_LIMIT + 5, Access::Read), Err(FaultError::NoVma));
    }

    #[test]
    fn cow_write_copies_once_then_reuses() {
        let (pool, mut parent) = space(64);
        parent.insert_vma(Vma::anonymous(0x1000, 0x2000, VmaFlags::READ | VmaFlags::WRITE)).unwrap();
        handle_fault(&mut parent, &NoPager, 0x1000, Access::Write).unwrap();
        let shared = PhysFrame::containing_address(parent.translate(0x1000).unwrap());
        pool.write(shared, 0, b"P");

        let mut child = parent.duplicate().unwrap();
        assert_eq!(handle_fault(&mut child, &NoPager, 0x1000, Access::Write), Ok(Resolution::CopiedOnWrite));
        let copy = PhysFrame::containing_address(child.translate(0x1000).unwrap());
        assert_ne!(copy, shared);
        let mut b = [0u8; 1];
        pool.read(copy, 0, &mut b);
        assert_eq!(&b, b"P");
        assert_eq!(pool.ref_count(shared), 1);

        // parent is now the sole holder: no copy needed
        assert_eq!(handle_fault(&mut parent, &NoPager, 0x1000, Access::Write), Ok(Resolution::Reused));
        assert_eq!(parent.translate(0x1000), Some(shared.start_address()));
        assert!(parent.page_table().lookup(0x1000).unwrap().is_writable());
    }

    #[test]
    fn fault_below_stack_grows_it() {
        let (_pool, mut mm) = space(32);
        let start = mm.vmas().stack().unwrap().start;
        let addr = start - 2 * PAGE_SIZE + 0x10;
        assert_eq!(handle_fault(&mut mm, &NoPager, addr, Access::Write), Ok(Resolution::Populated));
        assert_eq!(mm.vmas().stack().unwrap().start, start - 2 * PAGE_SIZE);
        let below = mm.stack_limit() - PAGE_SIZE;
        assert_eq!(handle_fault(&mut mm, &NoPager, below, Access::Write), Err(FaultError::NoVma));
    }

    #[test]
    fn device_mapping_uses_fixed_frames() {
        let (pool, mut mm) = space(16);
        mm.insert_vma(Vma::new(0x8000, 0xa000, VmaFlags::READ | VmaFlags::WRITE | VmaFlags::SHARED, VmaBacking::Device { phys: 0xfe20_0000 })).unwrap();
        handle_fault(&mut mm, &NoPager, 0x9000, Access::Read).unwrap();
        assert_eq!(mm.translate(0x9000), Some(0xfe20_1000));
        let free = pool.free_count();
        mm.unmap(0x8000, 0x2000).unwrap();
        assert_eq!(pool.free_count(), free);
    }
}
