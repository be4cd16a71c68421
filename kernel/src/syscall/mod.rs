// kernel/src/syscall/mod.rs
//
// System-call dispatch.  Numbers follow the Linux x86_64 table on every
// architecture.  Handlers run with the scheduler locked (one big kernel
// lock) and reach user memory only through `UserMemory`.

use alloc::sync::Arc;

use crate::error::{Errno, SysResult};
use crate::fs::OpenFile;
use crate::kernel::Kernel;
use crate::memory::user_copy::UserMemory;
use crate::process::{Pid, Process, Scheduler, Task, WaitChannel};

pub mod fs;
pub mod mm;
pub mod proc;
pub mod signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Stat = 4,
    Fstat = 5,
    Lstat = 6,
    Lseek = 8,
    Mmap = 9,
    Mprotect = 10,
    Munmap = 11,
    Brk = 12,
    RtSigaction = 13,
    RtSigprocmask = 14,
    RtSigreturn = 15,
    Ioctl = 16,
    Pread64 = 17,
    Pwrite64 = 18,
    Pipe = 22,
    SchedYield = 24,
    Dup = 32,
    Dup2 = 33,
    GetPid = 39,
    Fork = 57,
    Execve = 59,
    Exit = 60,
    Wait4 = 61,
    Kill = 62,
    Fcntl = 72,
    Fsync = 74,
    Truncate = 76,
    Ftruncate = 77,
    Getcwd = 79,
    Chdir = 80,
    Mkdir = 83,
    Rmdir = 84,
    Unlink = 87,
    Symlink = 88,
    Readlink = 89,
    GetUid = 102,
    GetGid = 104,
    SetUid = 105,
    SetGid = 106,
    GetEuid = 107,
    GetEgid = 108,
    SetPgid = 109,
    GetPpid = 110,
    SetSid = 112,
    GetPgid = 121,
    GetSid = 124,
    RtSigpending = 127,
    Sync = 162,
    Mount = 165,
    Getdents64 = 217,
    ExitGroup = 231,
    Pipe2 = 293,
}

impl SyscallNumber {
    pub fn from_u64(n: u64) -> Option<Self> {
        use SyscallNumber::*;
        const ALL: [SyscallNumber; 56] = [
            Read, Write, Open, Close, Stat, Fstat, Lstat, Lseek, Mmap, Mprotect, Munmap, Brk, RtSigaction,
            RtSigprocmask, RtSigreturn, Ioctl, Pread64, Pwrite64, Pipe, SchedYield, Dup, Dup2, GetPid, Fork,
            Execve, Exit, Wait4, Kill, Fcntl, Fsync, Truncate, Ftruncate, Getcwd, Chdir, Mkdir, Rmdir, Unlink,
            Symlink, Readlink, GetUid, GetGid, SetUid, SetGid, GetEuid, GetEgid, SetPgid, GetPpid, SetSid,
            GetPgid, GetSid, RtSigpending, Sync, Mount, Getdents64, ExitGroup, Pipe2,
        ];
        ALL.into_iter().find(|&s| s as u64 == n)
    }
}

/// What the trap exit does with the caller's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Store the value in the result register.
    Return(i64),
    /// The frame was rewound to re-issue the call; the task may be parked.
    Blocked,
    /// The calling process is gone.
    Exited,
    /// The frame was replaced wholesale (execve, sigreturn).
    NoReturn,
}

/// Everything a handler may touch.
pub struct SyscallCtx<'a> {
    pub kernel: &'a Kernel,
    pub sched: &'a mut Scheduler,
}

impl SyscallCtx<'_> {
    pub fn current(&mut self) -> Result<(&mut Process, &mut Task), Errno> {
        self.sched.current_mut().ok_or(Errno::ESRCH)
    }

    pub fn proc(&mut self) -> Result<&mut Process, Errno> {
        self.current().map(|(p, _)| p)
    }

    pub fn pid(&self) -> Result<Pid, Errno> {
        self.sched.current_pid().ok_or(Errno::ESRCH)
    }

    /// The caller's memory, faulting pages in as needed.
    pub fn user(&mut self) -> Result<UserMemory<'_>, Errno> {
        let pager = self.kernel.vfs();
        let mm = self.sched.current_mut().and_then(|(p, _)| p.mm.as_mut()).ok_or(Errno::EFAULT)?;
        Ok(UserMemory::new(mm, pager))
    }

    pub fn file(&mut self, fd: u64) -> Result<Arc<OpenFile>, Errno> {
        let fd = usize::try_from(fd).map_err(|_| Errno::EBADF)?;
        Ok(self.proc()?.files.get(fd)?)
    }

    /// Rewind the call and park the caller on `chan`.  With a signal
    /// already deliverable the task is not parked: the handler runs first
    /// and the call is issued again when it returns.
    pub fn block_on(&mut self, chan: WaitChannel) -> Result<Outcome, Errno> {
        let (proc, task) = self.current()?;
        task.trapframe.restart_syscall();
        if !proc.signals.has_deliverable() {
            self.sched.block_current(chan);
        }
        Ok(Outcome::Blocked)
    }

    pub fn cwd(&mut self) -> Result<alloc::string::String, Errno> {
        Ok(self.proc()?.cwd.clone())
    }
}

/// Run system call `nr` for the current task.
pub fn dispatch(cx: &mut SyscallCtx, nr: u64, a: [u64; 6]) -> Outcome {
    use SyscallNumber as S;

    let Some(call) = SyscallNumber::from_u64(nr) else {
        crate::serial_println!("syscall: unknown {} from pid {:?}", nr, cx.sched.current_pid());
        return Outcome::Return(Errno::ENOSYS.as_ret());
    };
    crate::serial_trace!("syscall: {:?}({:#x}, {:#x}, {:#x})", call, a[0], a[1], a[2]);

    let ret = |r: SysResult| r.map(Outcome::Return);
    let result = match call {
        S::Read => fs::sys_read(cx, a[0], a[1], a[2]),
        S::Write => fs::sys_write(cx, a[0], a[1], a[2]),
        S::Open => ret(fs::sys_open(cx, a[0], a[1], a[2])),
        S::Close => ret(fs::sys_close(cx, a[0])),
        S::Stat => ret(fs::sys_stat(cx, a[0], a[1], true)),
        S::Lstat => ret(fs::sys_stat(cx, a[0], a[1], false)),
        S::Fstat => ret(fs::sys_fstat(cx, a[0], a[1])),
        S::Lseek => ret(fs::sys_lseek(cx, a[0], a[1] as i64, a[2])),
        S::Ioctl => ret(fs::sys_ioctl(cx, a[0], a[1], a[2])),
        S::Pread64 => ret(fs::sys_pread(cx, a[0], a[1], a[2], a[3])),
        S::Pwrite64 => ret(fs::sys_pwrite(cx, a[0], a[1], a[2], a[3])),
        S::Pipe => ret(fs::sys_pipe(cx, a[0], 0)),
        S::Pipe2 => ret(fs::sys_pipe(cx, a[0], a[1])),
        S::Dup => ret(fs::sys_dup(cx, a[0])),
        S::Dup2 => ret(fs::sys_dup2(cx, a[0], a[1])),
        S::Fcntl => ret(fs::sys_fcntl(cx, a[0], a[1], a[2])),
        S::Fsync => ret(fs::sys_fsync(cx, a[0])),
        S::Truncate => ret(fs::sys_truncate(cx, a[0], a[1])),
        S::Ftruncate => ret(fs::sys_ftruncate(cx, a[0], a[1])),
        S::Getcwd => ret(fs::sys_getcwd(cx, a[0], a[1])),
        S::Chdir => ret(fs::sys_chdir(cx, a[0])),
        S::Mkdir => ret(fs::sys_mkdir(cx, a[0], a[1])),
        S::Rmdir => ret(fs::sys_rmdir(cx, a[0])),
        S::Unlink => ret(fs::sys_unlink(cx, a[0])),
        S::Symlink => ret(fs::sys_symlink(cx, a[0], a[1])),
        S::Readlink => ret(fs::sys_readlink(cx, a[0], a[1], a[2])),
        S::Sync => ret(fs::sys_sync(cx)),
        S::Mount => ret(fs::sys_mount(cx, a[1], a[2])),
        S::Getdents64 => ret(fs::sys_getdents64(cx, a[0], a[1], a[2])),

        S::Mmap => ret(mm::sys_mmap(cx, a[0], a[1], a[2], a[3], a[4], a[5])),
        S::Mprotect => ret(mm::sys_mprotect(cx, a[0], a[1], a[2])),
        S::Munmap => ret(mm::sys_munmap(cx, a[0], a[1])),
        S::Brk => ret(mm::sys_brk(cx, a[0])),

        S::SchedYield => ret(proc::sys_sched_yield(cx)),
        S::GetPid => ret(proc::sys_getpid(cx)),
        S::GetPpid => ret(proc::sys_getppid(cx)),
        S::Fork => ret(proc::sys_fork(cx)),
        S::Execve => proc::sys_execve(cx, a[0], a[1], a[2]),
        S::Exit | S::ExitGroup => proc::sys_exit(cx, a[0] as i32),
        S::Wait4 => proc::sys_wait4(cx, a[0] as i64, a[1], a[2]),
        S::GetUid | S::GetEuid | S::GetGid | S::GetEgid => ret(proc::sys_getid(cx, call)),
        S::SetUid => ret(proc::sys_setuid(cx, a[0] as u32)),
        S::SetGid => ret(proc::sys_setgid(cx, a[0] as u32)),
        S::SetPgid => ret(proc::sys_setpgid(cx, a[0] as u32, a[1] as u32)),
        S::GetPgid => ret(proc::sys_getpgid(cx, a[0] as u32)),
        S::SetSid => ret(proc::sys_setsid(cx)),
        S::GetSid => ret(proc::sys_getsid(cx, a[0] as u32)),

        S::RtSigaction => ret(signal::sys_rt_sigaction(cx, a[0] as u32, a[1], a[2], a[3])),
        S::RtSigprocmask => ret(signal::sys_rt_sigprocmask(cx, a[0], a[1], a[2], a[3])),
        S::RtSigpending => ret(signal::sys_rt_sigpending(cx, a[0], a[1])),
        S::RtSigreturn => signal::sys_rt_sigreturn(cx),
        S::Kill => ret(signal::sys_kill(cx, a[0] as i64 as i32, a[1] as u32)),
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            crate::serial_trace!("syscall: {:?} -> {:?}", call, e);
            Outcome::Return(e.as_ret())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip() {
        assert_eq!(SyscallNumber::from_u64(0), Some(SyscallNumber::Read));
        assert_eq!(SyscallNumber::from_u64(231), Some(SyscallNumber::ExitGroup));
        assert_eq!(SyscallNumber::from_u64(7), None);
        assert_eq!(SyscallNumber::from_u64(9999), None);
    }
}
