// kernel/src/allocator.rs
//
// Kernel heap: a first-fit free list kept in address order.
//
// Every allocation is preceded by a `Header` holding a magic number, the
// start of the block it was carved from and the block's size.  `dealloc`
// checks the magic before trusting the rest; a mismatch means the heap has
// been corrupted (or the pointer freed twice) and is fatal.  Freed blocks
// merge with their neighbours on reinsertion.
//
// The bare-metal binary registers a `KernelHeap` as `#[global_allocator]`;
// the library never does, so host tests keep the system allocator.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, null_mut};

use crate::sync::IrqLock;

const ALLOC_MAGIC: u64 = 0x6c75_6d65_6e48_6541;

/// Block granularity; every block start and size is a multiple.
const BLOCK_ALIGN: usize = 16;

#[repr(C)]
struct Header {
    magic: u64,
    block: usize,
    size: usize,
    _pad: usize,
}

const HEADER_SIZE: usize = size_of::<Header>();

#[repr(C)]
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

/// Smallest remainder worth splitting off as its own free block.
const MIN_BLOCK: usize = HEADER_SIZE + BLOCK_ALIGN;

const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

pub struct Heap {
    head: *mut FreeBlock,
    size: usize,
    used: usize,
}

unsafe impl Send for Heap {}

impl Heap {
    pub const fn empty() -> Self {
        Self { head: null_mut(), size: 0, used: 0 }
    }

    /// Hand `[start, start + size)` to the heap.
    ///
    /// # Safety
    /// The range must be writable, unused memory that outlives the heap.
    pub unsafe fn init(&mut self, start: usize, size: usize) {
        let base = align_up(start, BLOCK_ALIGN);
        let size = (start + size).saturating_sub(base) & !(BLOCK_ALIGN - 1);
        self.head = null_mut();
        self.size = size;
        self.used = 0;
        if size >= MIN_BLOCK {
            self.insert(base, size);
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of free blocks (fragmentation indicator).
    pub fn free_blocks(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).next };
        }
        n
    }

    pub fn allocate(&mut self, layout: Layout) -> *mut u8 {
        let align = layout.align().max(BLOCK_ALIGN);
        let mut prev: *mut FreeBlock = null_mut();
        let mut cur = self.head;

        while !cur.is_null() {
            let start = cur as usize;
            let (size, next) = unsafe { ((*cur).size, (*cur).next) };
            let payload = align_up(start + HEADER_SIZE, align);
            let end = align_up(payload + layout.size(), BLOCK_ALIGN);

            if end <= start + size {
                // Take the whole block unless the tail can stand alone.
                let tail = start + size - end;
                let mut next = next;
                let taken = if tail >= MIN_BLOCK {
                    let split = end as *mut FreeBlock;
                    unsafe { split.write(FreeBlock { size: tail, next }) };
                    next = split;
                    end - start
                } else {
                    size
                };

                if prev.is_null() {
                    self.head = next;
                } else {
                    unsafe { (*prev).next = next };
                }

                let header = (payload - HEADER_SIZE) as *mut Header;
                unsafe {
                    header.write(Header { magic: ALLOC_MAGIC, block: start, size: taken, _pad: 0 });
                }
                self.used += taken;
                return payload as *mut u8;
            }

            prev = cur;
            cur = next;
        }
        null_mut()
    }

    /// # Safety
    /// `ptr` must come from `allocate` on this heap.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let header = (ptr as usize - HEADER_SIZE) as *mut Header;
        let Header { magic, block, size, .. } = ptr::read(header);
        if magic != ALLOC_MAGIC {
            crate::serial_println_raw!("heap: bad magic {:#x} freeing {:p}", magic, ptr);
            panic!("kernel heap corrupted (block header at {:p})", header);
        }
        (*header).magic = 0;
        self.used -= size;
        self.insert(block, size);
    }

    /// Link `[addr, addr + size)` into the address-ordered list, merging
    /// with whichever neighbours touch it.
    unsafe fn insert(&mut self, addr: usize, size: usize) {
        let mut prev: *mut FreeBlock = null_mut();
        let mut cur = self.head;
        while !cur.is_null() && (cur as usize) < addr {
            prev = cur;
            cur = (*cur).next;
        }

        let node = addr as *mut FreeBlock;
        node.write(FreeBlock { size, next: cur });

        if !cur.is_null() && addr + size == cur as usize {
            (*node).size += (*cur).size;
            (*node).next = (*cur).next;
        }

        if prev.is_null() {
            self.head = node;
        } else if prev as usize + (*prev).size == addr {
            (*prev).size += (*node).size;
            (*prev).next = (*node).next;
        } else {
            (*prev).next = node;
        }
    }
}

/// The heap behind an interrupt-masking lock, usable as `#[global_allocator]`.
pub struct KernelHeap {
    inner: IrqLock<Heap>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self { inner: IrqLock::new(Heap::empty()) }
    }

    /// # Safety
    /// See `Heap::init`; call once, before the first allocation.
    pub unsafe fn init(&self, start: usize, size: usize) {
        self.inner.lock().init(start, size);
    }

    /// (bytes in use, heap size)
    pub fn usage(&self) -> (usize, usize) {
        let heap = self.inner.lock();
        (heap.used(), heap.size())
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner.lock().allocate(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.inner.lock().deallocate(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: usize = 64 * 1024;

    fn arena() -> (std::vec::Vec<u128>, Heap) {
        let mut buf = std::vec![0u128; ARENA / 16];
        let mut heap = Heap::empty();
        unsafe { heap.init(buf.as_mut_ptr() as usize, ARENA) };
        (buf, heap)
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let (_buf, mut heap) = arena();
        let a = heap.allocate(Layout::from_size_align(24, 8).unwrap());
        let b = heap.allocate(Layout::from_size_align(100, 64).unwrap());
        let c = heap.allocate(Layout::from_size_align(4096, 4096).unwrap());
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert_eq!(b as usize % 64, 0);
        assert_eq!(c as usize % 4096, 0);
        assert!(a as usize + 24 <= b as usize || b as usize + 100 <= a as usize);
        unsafe {
            ptr::write_bytes(a, 0xaa, 24);
            ptr::write_bytes(b, 0xbb, 100);
            assert_eq!(*a.add(23), 0xaa);
        }
    }

    #[test]
    fn freeing_everything_coalesces_back_to_one_block() {
        let (_buf, mut heap) = arena();
        let layout = Layout::from_size_align(200, 8).unwrap();
        let ptrs: std::vec::Vec<_> = (0..20).map(|_| heap.allocate(layout)).collect();
        assert!(heap.used() > 20 * 200);
        // Free every other block first so merges happen on both sides.
        for p in ptrs.iter().step_by(2) {
            unsafe { heap.deallocate(*p) };
        }
        assert!(heap.free_blocks() > 1);
        for p in ptrs.iter().skip(1).step_by(2) {
            unsafe { heap.deallocate(*p) };
        }
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.free_blocks(), 1);
    }

    #[test]
    fn exhaustion_returns_null() {
        let (_buf, mut heap) = arena();
        assert!(heap.allocate(Layout::from_size_align(ARENA, 8).unwrap()).is_null());
        let p = heap.allocate(Layout::from_size_align(ARENA / 2, 8).unwrap());
        assert!(!p.is_null());
        assert!(heap.allocate(Layout::from_size_align(ARENA / 2, 8).unwrap()).is_null());
        unsafe { heap.deallocate(p) };
        assert!(!heap.allocate(Layout::from_size_align(ARENA / 2, 8).unwrap()).is_null());
    }

    #[test]
    #[should_panic(expected = "kernel heap corrupted")]
    fn double_free_is_fatal() {
        let (_buf, mut heap) = arena();
        let p = heap.allocate(Layout::from_size_align(64, 8).unwrap());
        unsafe {
            heap.deallocate(p);
            heap.deallocate(p);
        }
    }
}
