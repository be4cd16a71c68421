// Anonymous and file mappings: demand paging, munmap splitting, mprotect
// and the program break.

mod common;

use common::*;
use lumen::error::Errno;
use lumen::fs::OpenFlags;
use lumen::memory::fault::{Access, FaultError};
use lumen::memory::layout::MMAP_BASE;
use lumen::process::signal::SIGSEGV;
use lumen::process::ExitStatus;
use lumen::syscall::mm::{MAP_ANONYMOUS, MAP_PRIVATE, MAP_SHARED, PROT_READ, PROT_WRITE};
use lumen::Kernel;

const PAGE: u64 = 4096;
const RW: u64 = PROT_READ | PROT_WRITE;
const ANON: u64 = MAP_PRIVATE | MAP_ANONYMOUS;

fn translate(k: &Kernel, va: u64) -> Option<u64> {
    k.with_current(|p, _| p.mm.as_ref().unwrap().translate(va)).unwrap()
}

fn vma_count(k: &Kernel) -> usize {
    k.with_current(|p, _| p.mm.as_ref().unwrap().vmas().len()).unwrap()
}

fn try_write(k: &Kernel, addr: u64, data: &[u8]) -> Result<(), Errno> {
    k.with_user_memory(|m| m.write(addr, data)).unwrap()
}

#[test]
fn anonymous_pages_appear_on_first_touch() {
    let k = boot();
    start(&k, "/prog");
    let addr = sys(&k, nr::MMAP, &[0, 2 * PAGE, RW, ANON, u64::MAX, 0]) as u64;
    assert!(addr >= MMAP_BASE);
    assert_eq!(addr % PAGE, 0);
    assert_eq!(translate(&k, addr), None);

    let free = pool(&k).free_count();
    assert_eq!(peek(&k, addr, 1), [0]);
    assert_eq!(peek(&k, addr + PAGE, 1), [0]);
    assert_eq!(pool(&k).free_count(), free - 2);

    let low = translate(&k, addr).unwrap();
    let high = translate(&k, addr + PAGE).unwrap();
    assert_ne!(low & !(PAGE - 1), high & !(PAGE - 1));

    poke(&k, addr, b"x");
    assert_eq!(peek(&k, addr + PAGE, 1), [0]);
}

#[test]
fn munmap_in_the_middle_splits_the_mapping() {
    let k = boot();
    start(&k, "/prog");
    let before = vma_count(&k);
    let addr = sys(&k, nr::MMAP, &[0, 3 * PAGE, RW, ANON, u64::MAX, 0]) as u64;
    for i in 0..3 {
        poke(&k, addr + i * PAGE, &[i as u8 + 1]);
    }
    assert_eq!(vma_count(&k), before + 1);

    let free = pool(&k).free_count();
    assert_eq!(sys(&k, nr::MUNMAP, &[addr + PAGE, PAGE]), 0);
    assert_eq!(vma_count(&k), before + 2);
    assert_eq!(pool(&k).free_count(), free + 1);
    assert_eq!(translate(&k, addr + PAGE), None);
    assert_eq!(try_write(&k, addr + PAGE, b"z"), Err(Errno::EFAULT));
    assert_eq!(peek(&k, addr, 1), [1]);
    assert_eq!(peek(&k, addr + 2 * PAGE, 1), [3]);

    assert_eq!(sys(&k, nr::MUNMAP, &[addr + 1, PAGE]), -22);
    assert_eq!(sys(&k, nr::MUNMAP, &[addr, 3 * PAGE]), 0);
    assert_eq!(vma_count(&k), before);
}

#[test]
fn mprotect_revokes_write_and_faults_raise_sigsegv() {
    let k = boot();
    let pid = start(&k, "/prog");
    let addr = sys(&k, nr::MMAP, &[0, PAGE, RW, ANON, u64::MAX, 0]) as u64;
    poke(&k, addr, b"ok");

    assert_eq!(sys(&k, nr::MPROTECT, &[addr, PAGE, 0x8]), -22);
    assert_eq!(sys(&k, nr::MPROTECT, &[addr, PAGE, PROT_READ]), 0);
    assert_eq!(peek(&k, addr, 2), b"ok");
    assert_eq!(try_write(&k, addr, b"no"), Err(Errno::EFAULT));

    assert_eq!(k.page_fault(addr, Access::Write), Err(FaultError::Protection));
    k.settle();
    assert_eq!(current_pid(&k), None);
    let status = k.scheduler().lock().process(pid).unwrap().exit_status;
    assert_eq!(status, Some(ExitStatus::Signaled { sig: SIGSEGV, core: true }));
}

#[test]
fn unmapped_access_is_a_segfault() {
    let k = boot();
    let pid = start(&k, "/prog");
    assert_eq!(k.page_fault(0x1000, Access::Read), Err(FaultError::NoVma));
    k.settle();
    let status = k.scheduler().lock().process(pid).unwrap().exit_status;
    assert_eq!(status, Some(ExitStatus::Signaled { sig: SIGSEGV, core: true }));
}

#[test]
fn brk_grows_and_shrinks_the_heap() {
    let k = boot();
    start(&k, "/prog");
    let base = sys(&k, nr::BRK, &[0]) as u64;
    assert_eq!(base % PAGE, 0);
    assert!(base >= DATA + DATA_SIZE);

    assert_eq!(sys(&k, nr::BRK, &[base + 0x2500]) as u64, base + 0x2500);
    poke(&k, base + 0x2000, b"heap");
    assert_eq!(peek(&k, base + 0x2000, 4), b"heap");

    // below the heap start is refused; the break stays put
    assert_eq!(sys(&k, nr::BRK, &[base - PAGE]) as u64, base + 0x2500);

    assert_eq!(sys(&k, nr::BRK, &[base]) as u64, base);
    assert_eq!(try_write(&k, base + 0x2000, b"x"), Err(Errno::EFAULT));
}

#[test]
fn file_mappings_share_or_copy_the_cached_page() {
    let k = boot();
    start(&k, "/prog");
    k.vfs().write_file("/f", b"hello page", 0o644).unwrap();
    let path = cstr(&k, SCRATCH, "/f");
    let fd = sys(&k, nr::OPEN, &[path, 2, 0]) as u64;

    let shared = sys(&k, nr::MMAP, &[0, PAGE, RW, MAP_SHARED, fd, 0]) as u64;
    let private = sys(&k, nr::MMAP, &[0, PAGE, RW, MAP_PRIVATE, fd, 0]) as u64;
    assert_eq!(peek(&k, shared, 10), b"hello page");
    assert_eq!(peek(&k, private, 10), b"hello page");
    // past the end of the file the page reads as zeros
    assert_eq!(peek(&k, shared + 100, 4), [0; 4]);

    poke(&k, shared, b"J");
    poke(&k, private, b"Y");

    let f = k.vfs().open("/", "/f", OpenFlags::RDONLY, 0).unwrap();
    let mut back = [0u8; 5];
    f.pread(&mut back, 0).unwrap();
    assert_eq!(&back, b"Jello");
    assert_eq!(peek(&k, private, 5), b"Yello");
    assert_eq!(peek(&k, shared, 5), b"Jello");
}

#[test]
fn mmap_rejects_bad_arguments() {
    let k = boot();
    start(&k, "/prog");
    assert_eq!(sys(&k, nr::MMAP, &[0, 0, RW, ANON, u64::MAX, 0]), -22);
    assert_eq!(sys(&k, nr::MMAP, &[0, PAGE, RW, MAP_ANONYMOUS, u64::MAX, 0]), -22);
    assert_eq!(sys(&k, nr::MMAP, &[0, PAGE, RW, ANON, u64::MAX, 123]), -22);
    assert_eq!(sys(&k, nr::MMAP, &[0, PAGE, RW, MAP_PRIVATE, 17, 0]), -9);

    let pipefd = SCRATCH;
    assert_eq!(sys(&k, nr::PIPE, &[pipefd]), 0);
    let rd = u32::from_le_bytes(peek(&k, pipefd, 4).try_into().unwrap()) as u64;
    assert_eq!(sys(&k, nr::MMAP, &[0, PAGE, PROT_READ, MAP_PRIVATE, rd, 0]), -19);
}

#[test]
fn lengths_that_wrap_the_address_space_are_rejected() {
    let k = boot();
    start(&k, "/prog");
    let huge = u64::MAX - 10;
    let before = vma_count(&k);
    assert_eq!(sys(&k, nr::MMAP, &[0, huge, RW, ANON, u64::MAX, 0]), -22);
    assert_eq!(sys(&k, nr::MMAP, &[MMAP_BASE, huge, RW, ANON | 0x10, u64::MAX, 0]), -22);
    assert_eq!(sys(&k, nr::MUNMAP, &[0x1000_0000, huge]), -22);
    assert_eq!(sys(&k, nr::MPROTECT, &[0x1000_0000, huge, PROT_READ]), -22);
    assert_eq!(vma_count(&k), before);
}
