// Pipes between processes under both empty/full policies.

mod common;

use common::*;
use lumen::config::PipePolicy;
use lumen::{Kernel, KernelConfig};

fn pipe(k: &Kernel) -> (u64, u64) {
    assert_eq!(sys(k, nr::PIPE, &[SCRATCH]), 0);
    let pair = peek(k, SCRATCH, 8);
    let rd = u32::from_le_bytes(pair[..4].try_into().unwrap());
    let wr = u32::from_le_bytes(pair[4..].try_into().unwrap());
    (rd as u64, wr as u64)
}

#[test]
fn blocked_reader_resumes_after_writer() {
    let k = boot();
    let parent = start(&k, "/prog");
    let (rd, wr) = pipe(&k);
    let child = sys(&k, nr::FORK, &[]) as u32;
    assert_eq!(sys(&k, nr::CLOSE, &[wr]), 0);

    let buf = SCRATCH + 0x100;
    let pc = k.current_frame().unwrap().pc();
    sys(&k, nr::READ, &[rd, buf, 16]);
    // parked with the call rewound for a restart
    assert_eq!(k.current_frame().unwrap().pc(), pc);
    k.settle();
    assert_eq!(current_pid(&k), Some(child));

    assert_eq!(sys(&k, nr::CLOSE, &[rd]), 0);
    poke(&k, buf, b"hi");
    assert_eq!(sys(&k, nr::WRITE, &[wr, buf, 2]), 2);
    sys(&k, nr::EXIT, &[0]);
    k.settle();

    assert_eq!(current_pid(&k), Some(parent));
    assert_eq!(sys(&k, nr::READ, &[rd, buf, 16]), 2);
    assert_eq!(peek(&k, buf, 2), b"hi");
    // every writer is gone: end of file
    assert_eq!(sys(&k, nr::READ, &[rd, buf, 16]), 0);
}

#[test]
fn return_zero_policy_never_blocks() {
    let k = boot_with(KernelConfig { pipe_policy: PipePolicy::ReturnZero, pipe_buffer: 8, ..KernelConfig::default() });
    let pid = start(&k, "/prog");
    let (rd, wr) = pipe(&k);
    let buf = SCRATCH + 0x100;

    assert_eq!(sys(&k, nr::READ, &[rd, buf, 4]), 0);
    poke(&k, buf, b"0123456789");
    assert_eq!(sys(&k, nr::WRITE, &[wr, buf, 10]), 8);
    assert_eq!(sys(&k, nr::WRITE, &[wr, buf, 10]), 0);
    k.settle();
    assert_eq!(current_pid(&k), Some(pid));

    assert_eq!(sys(&k, nr::READ, &[rd, buf, 16]), 8);
    assert_eq!(peek(&k, buf, 8), b"01234567");
}

#[test]
fn nonblocking_end_reports_eagain() {
    let k = boot();
    start(&k, "/prog");
    assert_eq!(sys(&k, 293, &[SCRATCH, 0o4000]), 0);
    let rd = u32::from_le_bytes(peek(&k, SCRATCH, 4).try_into().unwrap()) as u64;
    assert_eq!(sys(&k, nr::READ, &[rd, SCRATCH + 0x100, 4]), -11);
    assert_eq!(sys(&k, 293, &[SCRATCH, 0o1]), -22);
}

#[test]
fn read_into_a_bad_buffer_consumes_nothing() {
    let k = boot();
    start(&k, "/prog");
    let (rd, wr) = pipe(&k);
    let buf = SCRATCH + 0x100;
    poke(&k, buf, b"hi");
    assert_eq!(sys(&k, nr::WRITE, &[wr, buf, 2]), 2);

    assert_eq!(sys(&k, nr::READ, &[rd, 0x10, 2]), -14);
    assert_eq!(sys(&k, nr::READ, &[rd, TEXT, 2]), -14);
    assert_eq!(sys(&k, nr::READ, &[rd, buf + 0x10, 2]), 2);
    assert_eq!(peek(&k, buf + 0x10, 2), b"hi");
}

