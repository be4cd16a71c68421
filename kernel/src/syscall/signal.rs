// kernel/src/syscall/signal.rs
//
// Signal system calls.

use alloc::vec::Vec;

use super::{Outcome, SyscallCtx};
use crate::error::{Errno, SysResult};
use crate::process::signal::{self, SigAction, SigSet, SIGSEGV};
use crate::process::{ExitStatus, Pid, Process, INIT_PID};

/// The only `sigsetsize` accepted.
const SIGSET_SIZE: u64 = 8;

pub fn sys_rt_sigaction(cx: &mut SyscallCtx, sig: u32, act: u64, oldact: u64, size: u64) -> SysResult {
    if size != SIGSET_SIZE || !signal::valid_signal(sig) {
        return Err(Errno::EINVAL);
    }
    let new = if act != 0 {
        let mut user = cx.user()?;
        Some(SigAction {
            handler: user.read_u64(act)?,
            flags: user.read_u64(act + 8)?,
            restorer: user.read_u64(act + 16)?,
            mask: SigSet(user.read_u64(act + 24)?),
        })
    } else {
        None
    };

    let signals = &mut cx.proc()?.signals;
    let old = match new {
        Some(new) => {
            let old = signals.set_action(sig, new)?;
            if new.is_ignore() {
                signals.pending.remove(sig);
            }
            old
        }
        None => signals.action(sig),
    };

    if oldact != 0 {
        let mut user = cx.user()?;
        user.write_u64(oldact, old.handler)?;
        user.write_u64(oldact + 8, old.flags)?;
        user.write_u64(oldact + 16, old.restorer)?;
        user.write_u64(oldact + 24, old.mask.0)?;
    }
    Ok(0)
}

pub fn sys_rt_sigprocmask(cx: &mut SyscallCtx, how: u64, set: u64, oldset: u64, size: u64) -> SysResult {
    if size != SIGSET_SIZE {
        return Err(Errno::EINVAL);
    }
    let new = if set != 0 { Some(SigSet(cx.user()?.read_u64(set)?)) } else { None };
    let signals = &mut cx.proc()?.signals;
    let old = match new {
        Some(new) => signals.change_mask(how, new)?,
        None => signals.blocked,
    };
    if oldset != 0 {
        cx.user()?.write_u64(oldset, old.0)?;
    }
    Ok(0)
}

pub fn sys_rt_sigpending(cx: &mut SyscallCtx, set: u64, size: u64) -> SysResult {
    if size != SIGSET_SIZE {
        return Err(Errno::EINVAL);
    }
    let pending = cx.proc()?.signals.pending;
    cx.user()?.write_u64(set, pending.0)?;
    Ok(0)
}

/// Return from a handler.  A frame that does not check out kills the
/// process.
pub fn sys_rt_sigreturn(cx: &mut SyscallCtx) -> Result<Outcome, Errno> {
    let pager = cx.kernel.vfs();
    let (proc, task) = cx.current()?;
    let pid = proc.pid;
    let mm = proc.mm.as_mut().ok_or(Errno::EFAULT)?;
    match signal::restore_frame(mm, pager, &mut task.trapframe, &mut proc.signals) {
        Ok(()) => Ok(Outcome::NoReturn),
        Err(e) => {
            crate::serial_println!("sigreturn: pid {} bad frame ({:?})", pid, e);
            cx.sched.exit_process(pid, ExitStatus::Signaled { sig: SIGSEGV, core: true });
            Ok(Outcome::Exited)
        }
    }
}

fn may_signal(sender: &Process, target: &Process) -> bool {
    sender.creds.is_root() || sender.creds.uid == target.creds.uid || sender.creds.euid == target.creds.uid
}

/// kill(pid, sig): `pid > 0` one process, `0` the caller's group, `-1`
/// everyone but init and the caller, `< -1` group `-pid`.
pub fn sys_kill(cx: &mut SyscallCtx, pid: i32, sig: u32) -> SysResult {
    if sig != 0 && !signal::valid_signal(sig) {
        return Err(Errno::EINVAL);
    }
    let me = cx.pid()?;
    let my_pgid = cx.proc()?.pgid;
    let sched = &mut *cx.sched;
    let sender = sched.process(me).ok_or(Errno::ESRCH)?;

    let targets: Vec<Pid> = sched
        .pids()
        .into_iter()
        .filter_map(|p| sched.process(p))
        .filter(|t| !t.is_zombie())
        .filter(|t| match pid {
            p if p > 0 => t.pid == p as Pid,
            0 => t.pgid == my_pgid,
            -1 => t.pid != INIT_PID && t.pid != me,
            p => t.pgid == p.unsigned_abs(),
        })
        .map(|t| (t.pid, may_signal(sender, t)))
        .filter_map(|(p, ok)| ok.then_some(p))
        .collect();

    if targets.is_empty() {
        let exists = pid > 0 && sched.process(pid as Pid).is_some_and(|p| !p.is_zombie());
        return Err(if exists { Errno::EPERM } else { Errno::ESRCH });
    }
    for t in targets {
        sched.send_signal(t, sig)?;
    }
    Ok(0)
}
