// kernel/src/syscall/proc.rs
//
// Process lifecycle, identity and process-group system calls.

use alloc::vec::Vec;

use super::fs::path_arg;
use super::{Outcome, SyscallCtx, SyscallNumber};
use crate::error::{Errno, SysResult};
use crate::process::exec::{self, ARG_STRLEN};
use crate::process::fork::fork_current;
use crate::process::scheduler::ChildSelector;
use crate::process::{ExitStatus, Pid, WaitChannel};

pub const WNOHANG: u64 = 1;

/// Most argv/envp entries accepted.
const MAX_ARGS: usize = 4096;

pub fn sys_getpid(cx: &mut SyscallCtx) -> SysResult {
    Ok(cx.pid()? as i64)
}

pub fn sys_getppid(cx: &mut SyscallCtx) -> SysResult {
    Ok(cx.proc()?.ppid as i64)
}

pub fn sys_sched_yield(cx: &mut SyscallCtx) -> SysResult {
    cx.sched.request_resched();
    Ok(0)
}

pub fn sys_fork(cx: &mut SyscallCtx) -> SysResult {
    let entry = cx.kernel.task_entry();
    Ok(fork_current(cx.sched, entry)? as i64)
}

pub fn sys_execve(cx: &mut SyscallCtx, path: u64, argv: u64, envp: u64) -> Result<Outcome, Errno> {
    let path = path_arg(cx, path)?;
    let (argv, envp) = {
        let mut user = cx.user()?;
        let argv = if argv == 0 { Vec::new() } else { user.read_str_array(argv, MAX_ARGS, ARG_STRLEN)? };
        let envp = if envp == 0 { Vec::new() } else { user.read_str_array(envp, MAX_ARGS, ARG_STRLEN)? };
        (argv, envp)
    };
    let (cwd, creds) = {
        let proc = cx.proc()?;
        (proc.cwd.clone(), proc.creds)
    };

    let image = cx.kernel.loader().prepare(&cwd, &path, &argv, &envp, creds)?;

    // Past this point nothing can fail.
    let (proc, task) = cx.current()?;
    let closed = exec::commit(proc, task, image);
    let pipes: Vec<u64> = closed.iter().filter(|f| f.is_pipe()).map(|f| f.inode().id()).collect();
    drop(closed);
    for id in pipes {
        cx.sched.wake(WaitChannel::Pipe(id));
    }
    Ok(Outcome::NoReturn)
}

pub fn sys_exit(cx: &mut SyscallCtx, code: i32) -> Result<Outcome, Errno> {
    let pid = cx.pid()?;
    cx.sched.exit_process(pid, ExitStatus::Exited(code));
    Ok(Outcome::Exited)
}

pub fn sys_wait4(cx: &mut SyscallCtx, pid: i64, status: u64, options: u64) -> Result<Outcome, Errno> {
    if options & !WNOHANG != 0 {
        return Err(Errno::EINVAL);
    }
    let me = cx.pid()?;
    let sel = match pid {
        -1 => ChildSelector::Any,
        0 => ChildSelector::Group(cx.proc()?.pgid),
        p if p > 0 => ChildSelector::Pid(p as Pid),
        p => ChildSelector::Group(p.unsigned_abs() as Pid),
    };
    match cx.sched.reap_child(me, sel)? {
        Some((child, exit)) => {
            if status != 0 {
                cx.user()?.write_u32(status, exit.encode() as u32)?;
            }
            Ok(Outcome::Return(child as i64))
        }
        None if options & WNOHANG != 0 => Ok(Outcome::Return(0)),
        None => cx.block_on(WaitChannel::Child(me)),
    }
}

// ============================================================================
// Credentials
// ============================================================================

pub fn sys_getid(cx: &mut SyscallCtx, which: SyscallNumber) -> SysResult {
    let creds = cx.proc()?.creds;
    let id = match which {
        SyscallNumber::GetUid => creds.uid,
        SyscallNumber::GetEuid => creds.euid,
        SyscallNumber::GetGid => creds.gid,
        SyscallNumber::GetEgid => creds.egid,
        _ => return Err(Errno::ENOSYS),
    };
    Ok(id as i64)
}

pub fn sys_setuid(cx: &mut SyscallCtx, uid: u32) -> SysResult {
    let creds = &mut cx.proc()?.creds;
    if creds.is_root() {
        creds.uid = uid;
        creds.euid = uid;
    } else if uid == creds.uid {
        creds.euid = uid;
    } else {
        return Err(Errno::EPERM);
    }
    Ok(0)
}

pub fn sys_setgid(cx: &mut SyscallCtx, gid: u32) -> SysResult {
    let creds = &mut cx.proc()?.creds;
    if creds.is_root() {
        creds.gid = gid;
        creds.egid = gid;
    } else if gid == creds.gid {
        creds.egid = gid;
    } else {
        return Err(Errno::EPERM);
    }
    Ok(0)
}

// ============================================================================
// Process groups and sessions
// ============================================================================

pub fn sys_setpgid(cx: &mut SyscallCtx, pid: Pid, pgid: Pid) -> SysResult {
    let me = cx.pid()?;
    let target = if pid == 0 { me } else { pid };
    let my_sid = cx.proc()?.sid;
    let proc = cx.sched.process_mut(target).ok_or(Errno::ESRCH)?;
    if target != me && proc.ppid != me {
        return Err(Errno::ESRCH);
    }
    if proc.sid == proc.pid || proc.sid != my_sid {
        return Err(Errno::EPERM);
    }
    proc.pgid = if pgid == 0 { target } else { pgid };
    Ok(0)
}

pub fn sys_getpgid(cx: &mut SyscallCtx, pid: Pid) -> SysResult {
    let target = if pid == 0 { cx.pid()? } else { pid };
    Ok(cx.sched.process(target).ok_or(Errno::ESRCH)?.pgid as i64)
}

pub fn sys_setsid(cx: &mut SyscallCtx) -> SysResult {
    let proc = cx.proc()?;
    if proc.pgid == proc.pid {
        return Err(Errno::EPERM);
    }
    proc.sid = proc.pid;
    proc.pgid = proc.pid;
    Ok(proc.pid as i64)
}

pub fn sys_getsid(cx: &mut SyscallCtx, pid: Pid) -> SysResult {
    let target = if pid == 0 { cx.pid()? } else { pid };
    Ok(cx.sched.process(target).ok_or(Errno::ESRCH)?.sid as i64)
}
