// fork: copy-on-write sharing, the double return, wait4 and orphans.

mod common;

use common::*;
use lumen::memory::PhysFrame;
use lumen::syscall::mm::{MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use lumen::syscall::proc::WNOHANG;
use lumen::Kernel;

/// (frame address, writable, cow) of the current process's page at `va`.
fn leaf(k: &Kernel, va: u64) -> (u64, bool, bool) {
    k.with_current(|p, _| {
        let pte = p.mm.as_ref().unwrap().page_table().lookup(va).expect("page not present");
        (pte.addr(), pte.is_writable(), pte.is_cow())
    })
    .unwrap()
}

fn refs(k: &Kernel, frame: u64) -> usize {
    k.pool().ref_count(PhysFrame::containing_address(frame))
}

#[test]
fn child_write_copies_only_the_touched_page() {
    let k = boot();
    let parent = start(&k, "/p");
    let rw = PROT_READ | PROT_WRITE;
    let flags = MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED;
    assert_eq!(sys(&k, nr::MMAP, &[0x1000, 0x2000, rw, flags, u64::MAX, 0]), 0x1000);
    poke(&k, 0x1000, b"P");
    poke(&k, 0x2000, b"Q");
    let (p_low, _, _) = leaf(&k, 0x1000);
    let (p_high, _, _) = leaf(&k, 0x2000);

    let child = sys(&k, nr::FORK, &[]);
    assert!(child > parent as i64);
    assert_eq!(leaf(&k, 0x1000), (p_low, false, true));
    assert_eq!(refs(&k, p_low), 2);

    yield_now(&k);
    assert_eq!(current_pid(&k), Some(child as u32));
    assert_eq!(k.with_current(|_, t| t.trapframe.return_value()), Some(0));
    assert_eq!(sys(&k, nr::GETPPID, &[]), parent as i64);

    // reads after fork allocate nothing
    let free = k.pool().free_count();
    assert_eq!(peek(&k, 0x1000, 1), b"P");
    assert_eq!(peek(&k, 0x2000, 1), b"Q");
    assert_eq!(k.pool().free_count(), free);

    poke(&k, 0x1000, b"C");
    let (c_low, writable, cow) = leaf(&k, 0x1000);
    assert_ne!(c_low, p_low);
    assert!(writable && !cow);
    assert_eq!(refs(&k, p_low), 1);
    // the untouched page is still shared
    assert_eq!(leaf(&k, 0x2000), (p_high, false, true));
    assert_eq!(refs(&k, p_high), 2);

    sys(&k, nr::EXIT, &[7]);
    k.settle();
    assert_eq!(current_pid(&k), Some(parent));
    assert_eq!(peek(&k, 0x1000, 1), b"P");

    assert_eq!(sys(&k, nr::WAIT4, &[child as u64, SCRATCH, 0, 0]), child);
    assert_eq!(peek(&k, SCRATCH, 4), (7u32 << 8).to_le_bytes());
    assert_eq!(refs(&k, p_high), 1);
}

#[test]
fn wnohang_and_orphans() {
    let k = boot();
    let init = start(&k, "/init");
    let child = sys(&k, nr::FORK, &[]) as u32;
    assert_eq!(sys(&k, nr::WAIT4, &[u64::MAX, 0, WNOHANG, 0]), 0);

    yield_now(&k);
    assert_eq!(current_pid(&k), Some(child));
    let grandchild = sys(&k, nr::FORK, &[]) as u32;
    sys(&k, nr::EXIT, &[0]);
    k.settle();

    // the grandchild now belongs to init
    let sched = k.scheduler().lock();
    assert_eq!(sched.process(grandchild).unwrap().ppid, init);
    drop(sched);

    while current_pid(&k) != Some(init) {
        yield_now(&k);
    }
    assert_eq!(sys(&k, nr::WAIT4, &[u64::MAX, 0, WNOHANG, 0]), child as i64);
    // ECHILD only once nothing is left to wait for
    assert_eq!(sys(&k, nr::WAIT4, &[child as u64, 0, WNOHANG, 0]), -10);
}

#[test]
fn fork_shares_open_files() {
    let k = boot();
    start(&k, "/p");
    let path = cstr(&k, SCRATCH, "/shared");
    let fd = sys(&k, nr::OPEN, &[path, 0o102, 0o644]); // O_RDWR | O_CREAT
    assert!(fd >= 0);
    sys(&k, nr::FORK, &[]);

    yield_now(&k);
    poke(&k, SCRATCH, b"from child");
    assert_eq!(sys(&k, nr::WRITE, &[fd as u64, SCRATCH, 10]), 10);
    sys(&k, nr::EXIT, &[0]);
    k.settle();

    // same open file: the offset moved for the parent too
    assert_eq!(sys(&k, nr::LSEEK, &[fd as u64, 0, 1]), 10);
    assert_eq!(sys(&k, nr::LSEEK, &[fd as u64, 0, 0]), 0);
    assert_eq!(sys(&k, nr::READ, &[fd as u64, SCRATCH + 0x100, 10]), 10);
    assert_eq!(peek(&k, SCRATCH + 0x100, 10), b"from child");
}
