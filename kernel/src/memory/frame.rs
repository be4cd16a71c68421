// kernel/src/memory/frame.rs
//
// Physical frame pool: a bitmap over one contiguous range of RAM plus a
// reference count per frame.  Frames shared copy-on-write, or mapped from
// the page cache into a process, carry one reference per holder and go
// back to the free bitmap when the last one is dropped.
//
// Frame contents are reached through a fixed physical-to-virtual offset
// (the bootloader's direct map, or a heap buffer on hosted builds).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;

use super::{PAGE_SHIFT, PAGE_SIZE};
use crate::sync::IrqLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(u64);

impl PhysFrame {
    pub const fn containing_address(phys: u64) -> Self {
        Self(phys & !(PAGE_SIZE - 1))
    }

    pub const fn start_address(self) -> u64 {
        self.0
    }
}

struct PoolState {
    bitmap: Vec<u64>,
    refs: Vec<u16>,
    free: usize,
    /// Where the next search starts.
    hint: usize,
}

impl PoolState {
    fn is_used(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set_used(&mut self, idx: usize, used: bool) {
        if used {
            self.bitmap[idx / 64] |= 1 << (idx % 64);
        } else {
            self.bitmap[idx / 64] &= !(1 << (idx % 64));
        }
    }
}

pub struct FramePool {
    phys_base: u64,
    virt_base: usize,
    frames: usize,
    state: IrqLock<PoolState>,
    /// Heap buffer backing a pool built by `new_heap_backed`.
    backing: Option<(NonNull<u8>, Layout)>,
}

unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Pool over `frames` frames of RAM starting at `phys_base`, visible to
    /// the kernel at `virt_base`.
    ///
    /// # Safety
    /// The range must be unused RAM, mapped read/write at `virt_base`.
    pub unsafe fn new(phys_base: u64, virt_base: usize, frames: usize) -> Self {
        Self {
            phys_base,
            virt_base,
            frames,
            state: IrqLock::new(PoolState {
                bitmap: vec![0; frames.div_ceil(64)],
                refs: vec![0; frames],
                free: frames,
                hint: 0,
            }),
            backing: None,
        }
    }

    /// Pool backed by a page-aligned heap buffer.  Physical addresses start
    /// at 0x4000_0000 so they never coincide with the buffer's addresses.
    pub fn new_heap_backed(frames: usize) -> Arc<Self> {
        let layout = Layout::from_size_align(frames * PAGE_SIZE as usize, PAGE_SIZE as usize)
            .unwrap_or_else(|_| panic!("frame pool of {} frames", frames));
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(buf) = NonNull::new(ptr) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        let mut pool = unsafe { Self::new(0x4000_0000, buf.as_ptr() as usize, frames) };
        pool.backing = Some((buf, layout));
        Arc::new(pool)
    }

    fn index(&self, frame: PhysFrame) -> Option<usize> {
        let phys = frame.start_address();
        if phys < self.phys_base {
            return None;
        }
        let idx = ((phys - self.phys_base) >> PAGE_SHIFT) as usize;
        (idx < self.frames).then_some(idx)
    }

    fn frame_at(&self, idx: usize) -> PhysFrame {
        PhysFrame(self.phys_base + ((idx as u64) << PAGE_SHIFT))
    }

    /// Does this pool manage `frame`?  Device memory mapped into a process
    /// is not ours and is never counted.
    pub fn owns(&self, frame: PhysFrame) -> bool {
        self.index(frame).is_some()
    }

    pub fn total_frames(&self) -> usize {
        self.frames
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free
    }

    /// One frame with a reference count of 1, contents undefined.
    pub fn alloc_frame(&self) -> Option<PhysFrame> {
        let mut st = self.state.lock();
        if st.free == 0 {
            return None;
        }
        for step in 0..self.frames {
            let idx = (st.hint + step) % self.frames;
            if !st.is_used(idx) {
                st.set_used(idx, true);
                st.refs[idx] = 1;
                st.free -= 1;
                st.hint = idx + 1;
                return Some(self.frame_at(idx));
            }
        }
        None
    }

    pub fn alloc_zeroed(&self) -> Option<PhysFrame> {
        let frame = self.alloc_frame()?;
        self.zero(frame);
        Some(frame)
    }

    /// `count` physically contiguous frames, each with a count of 1.
    pub fn alloc_contiguous(&self, count: usize) -> Option<PhysFrame> {
        let mut st = self.state.lock();
        if count == 0 || st.free < count {
            return None;
        }
        let mut run = 0;
        for idx in 0..self.frames {
            if st.is_used(idx) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = idx + 1 - count;
                for i in first..=idx {
                    st.set_used(i, true);
                    st.refs[i] = 1;
                }
                st.free -= count;
                return Some(self.frame_at(first));
            }
        }
        None
    }

    /// Drop one reference; the frame is free once none remain.
    pub fn free_frame(&self, frame: PhysFrame) {
        let Some(idx) = self.index(frame) else {
            return;
        };
        let mut st = self.state.lock();
        if !st.is_used(idx) || st.refs[idx] == 0 {
            crate::serial_println_raw!("frame: double free of {:#x} ignored", frame.start_address());
            return;
        }
        st.refs[idx] -= 1;
        if st.refs[idx] == 0 {
            st.set_used(idx, false);
            st.free += 1;
            if idx < st.hint {
                st.hint = idx;
            }
        }
    }

    pub fn free_contiguous(&self, first: PhysFrame, count: usize) {
        for i in 0..count as u64 {
            self.free_frame(PhysFrame(first.start_address() + i * PAGE_SIZE));
        }
    }

    /// Take another reference to an allocated frame.
    pub fn inc_ref(&self, frame: PhysFrame) {
        let Some(idx) = self.index(frame) else {
            return;
        };
        let mut st = self.state.lock();
        if st.is_used(idx) {
            st.refs[idx] = st.refs[idx].saturating_add(1);
        }
    }

    pub fn ref_count(&self, frame: PhysFrame) -> usize {
        match self.index(frame) {
            Some(idx) => self.state.lock().refs[idx] as usize,
            None => 0,
        }
    }

    /// Mark a frame as permanently in use (firmware, kernel image, ...).
    pub fn reserve(&self, frame: PhysFrame) {
        let Some(idx) = self.index(frame) else {
            return;
        };
        let mut st = self.state.lock();
        if !st.is_used(idx) {
            st.set_used(idx, true);
            st.refs[idx] = 1;
            st.free -= 1;
        }
    }

    // ========================================================================
    // Frame contents
    // ========================================================================

    /// Kernel-visible address of a physical address inside the pool.
    ///
    /// On a direct-mapped pool this also works for physical addresses the
    /// pool does not manage (the boot page tables, for instance).
    pub fn phys_to_virt(&self, phys: u64) -> *mut u8 {
        (self.virt_base as u64).wrapping_add(phys.wrapping_sub(self.phys_base)) as *mut u8
    }

    /// The frame's 4 KiB as a byte slice.
    ///
    /// # Safety
    /// The frame must belong to this pool and the caller must have the
    /// only live view of it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, frame: PhysFrame) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.phys_to_virt(frame.start_address()), PAGE_SIZE as usize)
    }

    pub fn zero(&self, frame: PhysFrame) {
        if self.owns(frame) {
            unsafe { core::ptr::write_bytes(self.phys_to_virt(frame.start_address()), 0, PAGE_SIZE as usize) };
        }
    }

    pub fn copy_frame(&self, dst: PhysFrame, src: PhysFrame) {
        if self.owns(dst) && self.owns(src) {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.phys_to_virt(src.start_address()),
                    self.phys_to_virt(dst.start_address()),
                    PAGE_SIZE as usize,
                );
            }
        }
    }

    /// Copy out of a frame starting at byte `offset`.
    pub fn read(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= PAGE_SIZE as usize);
        if self.owns(frame) {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.phys_to_virt(frame.start_address()).add(offset),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
        }
    }

    pub fn write(&self, frame: PhysFrame, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= PAGE_SIZE as usize);
        if self.owns(frame) {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    self.phys_to_virt(frame.start_address()).add(offset),
                    data.len(),
                );
            }
        }
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        if let Some((buf, layout)) = self.backing.take() {
            unsafe { alloc::alloc::dealloc(buf.as_ptr(), layout) };
        }
    }
}
