// kernel/src/init/memory.rs
//
// Carve the largest usable region of the boot memory map into the kernel
// heap (first part) and the frame pool (the rest).  Both are reached
// through the bootloader's physical-memory mapping.

use alloc::sync::Arc;

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};

use lumen::allocator::KernelHeap;
use lumen::memory::{page_align_down, page_align_up, FramePool, PAGE_SIZE};
use lumen::serial_println;

#[global_allocator]
static HEAP: KernelHeap = KernelHeap::new();

const HEAP_SIZE: u64 = 16 * 1024 * 1024;

pub fn init(phys_offset: u64, regions: &MemoryRegions) -> Arc<FramePool> {
    let usable = regions.iter().filter(|r| r.kind == MemoryRegionKind::Usable);
    let region = usable
        .clone()
        .max_by_key(|r| r.end - r.start)
        .expect("no usable memory in the boot memory map");
    serial_println!(
        "memory: {} usable regions, using {:#x}..{:#x}",
        usable.count(),
        region.start,
        region.end
    );

    let start = page_align_up(region.start);
    let end = page_align_down(region.end);
    let heap_size = HEAP_SIZE.min((end - start) / 4) & !(PAGE_SIZE - 1);
    unsafe { HEAP.init((phys_offset + start) as usize, heap_size as usize) };

    let pool_start = start + heap_size;
    let frames = ((end - pool_start) / PAGE_SIZE) as usize;
    let pool = unsafe { FramePool::new(pool_start, (phys_offset + pool_start) as usize, frames) };
    serial_println!(
        "memory: heap {} KiB, frame pool {} frames at {:#x}",
        heap_size / 1024,
        frames,
        pool_start
    );
    Arc::new(pool)
}
