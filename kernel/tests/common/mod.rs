// Shared harness: a kernel over a heap-backed frame pool with ramfs at `/`
// and devfs at `/dev`, plus helpers to act as the current process.

#![allow(dead_code)]

use std::sync::Arc;

use lumen::fs::devfs::DevFs;
use lumen::fs::ramfs::RamNode;
use lumen::memory::FramePool;
use lumen::process::elf::build::{executable, Segment};
use lumen::process::elf::{PF_R, PF_W, PF_X};
use lumen::process::Pid;
use lumen::{Kernel, KernelConfig};

pub const TEXT: u64 = 0x40_0000;
pub const DATA: u64 = 0x60_0000;
pub const DATA_SIZE: u64 = 0x4000;
/// Scratch area inside the data segment for syscall arguments.
pub const SCRATCH: u64 = DATA + 0x1000;

pub mod nr {
    pub const READ: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const OPEN: u64 = 2;
    pub const CLOSE: u64 = 3;
    pub const LSEEK: u64 = 8;
    pub const MMAP: u64 = 9;
    pub const MPROTECT: u64 = 10;
    pub const MUNMAP: u64 = 11;
    pub const BRK: u64 = 12;
    pub const RT_SIGACTION: u64 = 13;
    pub const RT_SIGPROCMASK: u64 = 14;
    pub const RT_SIGRETURN: u64 = 15;
    pub const PIPE: u64 = 22;
    pub const SCHED_YIELD: u64 = 24;
    pub const GETPID: u64 = 39;
    pub const FORK: u64 = 57;
    pub const EXECVE: u64 = 59;
    pub const EXIT: u64 = 60;
    pub const WAIT4: u64 = 61;
    pub const KILL: u64 = 62;
    pub const FCNTL: u64 = 72;
    pub const GETPPID: u64 = 110;
    pub const SYNC: u64 = 162;
}

pub fn boot_with(config: KernelConfig) -> Kernel {
    let pool = FramePool::new_heap_backed(2048);
    let kernel = Kernel::new(pool, RamNode::new_root(), config, None, 0);
    kernel.vfs().mkdir("/", "/dev", 0o755).unwrap();
    kernel.vfs().mount("/dev", DevFs::new().root()).unwrap();
    kernel
}

pub fn boot() -> Kernel {
    boot_with(KernelConfig::default())
}

/// A program with one executable text page and a writable data segment.
pub fn program() -> Vec<u8> {
    let text = [0x90u8; 64];
    executable(
        TEXT,
        &[
            Segment { vaddr: TEXT, flags: PF_R | PF_X, data: &text, memsz: 64 },
            Segment { vaddr: DATA, flags: PF_R | PF_W, data: b"data!", memsz: DATA_SIZE },
        ],
    )
}

/// Install the test program at `path` and run it as the current process.
pub fn start(kernel: &Kernel, path: &str) -> Pid {
    kernel.vfs().write_file(path, &program(), 0o755).unwrap();
    let pid = kernel.spawn(path, &[path]).unwrap();
    kernel.settle();
    assert_eq!(current_pid(kernel), Some(pid));
    pid
}

pub fn current_pid(kernel: &Kernel) -> Option<Pid> {
    kernel.scheduler().lock().current_pid()
}

pub fn sys(kernel: &Kernel, nr: u64, args: &[u64]) -> i64 {
    let mut a = [0u64; 6];
    a[..args.len()].copy_from_slice(args);
    kernel.issue_syscall(nr, a).expect("no current task")
}

/// Give up the CPU and let the scheduler pick the next task.
pub fn yield_now(kernel: &Kernel) {
    assert_eq!(sys(kernel, nr::SCHED_YIELD, &[]), 0);
    kernel.settle();
}

pub fn poke(kernel: &Kernel, addr: u64, data: &[u8]) {
    kernel.with_user_memory(|m| m.write(addr, data)).unwrap().unwrap();
}

pub fn peek(kernel: &Kernel, addr: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    kernel.with_user_memory(|m| m.read(addr, &mut buf)).unwrap().unwrap();
    buf
}

/// Put a NUL-terminated string at `addr` and return `addr`.
pub fn cstr(kernel: &Kernel, addr: u64, s: &str) -> u64 {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    poke(kernel, addr, &bytes);
    addr
}

pub fn pool(kernel: &Kernel) -> &Arc<FramePool> {
    kernel.pool()
}
