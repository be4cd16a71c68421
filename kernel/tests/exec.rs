// execve: image replacement, the initial stack, close-on-exec and
// failures that leave the caller untouched.

mod common;

use common::*;
use lumen::process::elf::build::{executable, Segment};
use lumen::process::elf::{PF_R, PF_W, PF_X};
use lumen::process::signal::{SigAction, SIGINT, SIGUSR1, SIG_IGN};
use lumen::syscall::mm::{MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use lumen::Kernel;

const OTHER_ENTRY: u64 = TEXT + 0x10;
const F_GETFD: u64 = 1;

fn other_program() -> Vec<u8> {
    let text = [0x90u8; 32];
    executable(
        OTHER_ENTRY,
        &[
            Segment { vaddr: TEXT, flags: PF_R | PF_X, data: &text, memsz: 32 },
            Segment { vaddr: DATA, flags: PF_R | PF_W, data: b"OTHER", memsz: 0x100 },
        ],
    )
}

/// Lay out `args` as a NULL-terminated argv array in scratch memory.
fn argv(k: &Kernel, args: &[&str]) -> u64 {
    let table = SCRATCH + 0x800;
    let mut at = SCRATCH + 0x100;
    for (i, a) in args.iter().enumerate() {
        cstr(k, at, a);
        poke(k, table + 8 * i as u64, &at.to_le_bytes());
        at += a.len() as u64 + 1;
    }
    poke(k, table + 8 * args.len() as u64, &0u64.to_le_bytes());
    table
}

#[test]
fn exec_replaces_the_image() {
    let k = boot();
    let pid = start(&k, "/prog");
    k.vfs().write_file("/other", &other_program(), 0o755).unwrap();

    let rw = PROT_READ | PROT_WRITE;
    let fixed = MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED;
    assert_eq!(sys(&k, nr::MMAP, &[0x10_0000, 0x1000, rw, fixed, u64::MAX, 0]), 0x10_0000);
    poke(&k, 0x10_0000, b"old");

    let keep_path = cstr(&k, SCRATCH, "/keep");
    let keep = sys(&k, nr::OPEN, &[keep_path, 0o102, 0o644]) as u64;
    let gone_path = cstr(&k, SCRATCH + 0x40, "/gone");
    let gone = sys(&k, nr::OPEN, &[gone_path, 0o2000102, 0o644]) as u64;
    assert_eq!(sys(&k, nr::FCNTL, &[gone, F_GETFD, 0]), 1);

    k.with_current(|p, _| {
        p.signals.set_action(SIGUSR1, SigAction { handler: TEXT, ..Default::default() }).unwrap();
        p.signals.set_action(SIGINT, SigAction { handler: SIG_IGN, ..Default::default() }).unwrap();
    });

    let path = cstr(&k, SCRATCH + 0x80, "/other");
    let args = argv(&k, &["/other", "hello", "world"]);
    sys(&k, nr::EXECVE, &[path, args, 0]);
    k.settle();

    let tf = k.current_frame().unwrap();
    assert_eq!(tf.pc(), OTHER_ENTRY);
    assert_eq!(current_pid(&k), Some(pid));
    assert_eq!(sys(&k, nr::GETPID, &[]), pid as i64);
    assert_eq!(peek(&k, DATA, 5), b"OTHER");

    let sp = tf.sp();
    assert_eq!(sp % 16, 0);
    assert_eq!(peek(&k, sp, 8), 3u64.to_le_bytes());
    let args = k.with_user_memory(|m| m.read_str_array(sp + 8, 8, 64)).unwrap().unwrap();
    assert_eq!(args, ["/other", "hello", "world"]);

    let old = k.with_current(|p, _| p.mm.as_ref().unwrap().find_vma(0x10_0000).is_none()).unwrap();
    assert!(old, "old mapping survived exec");

    assert_eq!(sys(&k, nr::FCNTL, &[keep, F_GETFD, 0]), 0);
    assert_eq!(sys(&k, nr::FCNTL, &[gone, F_GETFD, 0]), -9);

    let (usr1, int) = k.with_current(|p, _| (p.signals.action(SIGUSR1), p.signals.action(SIGINT))).unwrap();
    assert!(usr1.is_default());
    assert!(int.is_ignore());
}

#[test]
fn failed_exec_leaves_the_caller_intact() {
    let k = boot();
    let pid = start(&k, "/prog");
    k.vfs().write_file("/text", b"#!/bin/sh\necho hi\n", 0o755).unwrap();
    k.vfs().write_file("/plain", &other_program(), 0o644).unwrap();
    let args = argv(&k, &["x"]);
    let free = pool(&k).free_count();

    for (name, errno) in [("/missing", -2), ("/plain", -13), ("/text", -8), ("/", -13)] {
        let path = cstr(&k, SCRATCH, name);
        let before = k.current_frame().unwrap();
        assert_eq!(sys(&k, nr::EXECVE, &[path, args, 0]), errno, "{name}");
        k.settle();
        let after = k.current_frame().unwrap();
        assert_eq!(after.pc(), before.pc() + lumen::arch::current::SYSCALL_INSN_LEN);
        assert_eq!(after.sp(), before.sp());
    }
    assert_eq!(current_pid(&k), Some(pid));
    assert_eq!(peek(&k, DATA, 5), b"data!");
    // only cache pages of the files just read may be missing
    assert!(pool(&k).free_count() + k.vfs().cache().lock().len() >= free);

    assert_eq!(sys(&k, nr::EXECVE, &[0, args, 0]), -14);
}

#[test]
fn forked_child_execs_while_parent_waits() {
    let k = boot();
    let parent = start(&k, "/prog");
    k.vfs().write_file("/other", &other_program(), 0o755).unwrap();
    let child = sys(&k, nr::FORK, &[]);
    yield_now(&k);
    assert_eq!(current_pid(&k), Some(child as u32));

    let path = cstr(&k, SCRATCH, "/other");
    let args = argv(&k, &["/other"]);
    sys(&k, nr::EXECVE, &[path, args, 0]);
    k.settle();
    assert_eq!(peek(&k, DATA, 5), b"OTHER");
    sys(&k, nr::EXIT, &[3]);
    k.settle();

    assert_eq!(current_pid(&k), Some(parent));
    assert_eq!(peek(&k, DATA, 5), b"data!");
    let status = SCRATCH + 0x400;
    assert_eq!(sys(&k, nr::WAIT4, &[child as u64, status, 0, 0]), child);
    assert_eq!(peek(&k, status, 4), (3u32 << 8).to_le_bytes());
}
