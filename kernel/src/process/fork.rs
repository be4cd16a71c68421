// kernel/src/process/fork.rs
//
// fork: a new process whose address space is a copy-on-write duplicate of
// the caller's, with the same descriptors, signal dispositions, cwd and
// credentials.  The child's task resumes at the same point of the same
// system call with 0 as its result.

use super::scheduler::Scheduler;
use super::{Pid, Process};
use crate::error::Errno;

/// Fork the running process.  `task_entry` is where new tasks start in
/// kernel mode (the trap-return trampoline).  Returns the child's pid.
pub fn fork_current(sched: &mut Scheduler, task_entry: u64) -> Result<Pid, Errno> {
    let child_pid = sched.peek_next_id();
    let (parent, task) = sched.current_mut().ok_or(Errno::ESRCH)?;
    let mm = parent.mm.as_mut().ok_or(Errno::ESRCH)?.duplicate()?;

    let mut child = Process::new(child_pid, parent.pid, mm, parent.files.clone());
    child.pgid = parent.pgid;
    child.sid = parent.sid;
    child.creds = parent.creds;
    child.signals = parent.signals.fork_copy();
    child.cwd = parent.cwd.clone();
    child.name = parent.name.clone();

    let child_task = task.fork(child_pid, child_pid, task_entry).ok_or(Errno::ENOMEM)?;
    let id = sched.alloc_id();
    debug_assert_eq!(id, child_pid);
    crate::serial_trace!("fork: {} -> {}", child.ppid, child_pid);
    sched.add_process(child, child_task);
    Ok(child_pid)
}
