// kernel/src/process/scheduler.rs
//
// Round-robin scheduler and owner of the process and task tables.
//
// `schedule()` only decides: it updates states and the current task and
// returns the pair of contexts to switch between.  The trap code performs
// the actual `switch_context` after dropping the scheduler lock.  When no
// task is ready the CPU falls back to the idle context (the boot thread).

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use super::signal::{self, SIGCHLD, SIGCONT, SIGKILL};
use super::task::{Task, TaskState, WaitChannel};
use super::{ExitStatus, Pid, Process, ProcessState, Tid, INIT_PID};
use crate::arch::{self, Context};
use crate::error::Errno;

/// A context switch for the trap code to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub old: *mut Context,
    pub new: *const Context,
    /// Kernel stack top of the incoming task (for the TSS); 0 for idle.
    pub kernel_stack_top: u64,
}

/// Which children a `wait4` is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSelector {
    Any,
    Pid(Pid),
    Group(Pid),
}

pub struct Scheduler {
    procs: BTreeMap<Pid, Process>,
    tasks: BTreeMap<Tid, Box<Task>>,
    ready: VecDeque<Tid>,
    current: Option<Tid>,
    idle: Box<Context>,
    next_id: u32,
    quantum: u32,
    slice_left: u32,
    ticks: u64,
    need_resched: bool,
    /// Root installed while no user address space is active.
    kernel_root: Option<u64>,
}

impl Scheduler {
    pub fn new(quantum: u32, kernel_root: Option<u64>) -> Self {
        Self {
            procs: BTreeMap::new(),
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            current: None,
            idle: Box::new(Context::default()),
            next_id: 1,
            quantum: quantum.max(1),
            slice_left: quantum.max(1),
            ticks: 0,
            need_resched: false,
            kernel_root,
        }
    }

    /// A fresh id; a process and its task share it.
    pub fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn peek_next_id(&self) -> u32 {
        self.next_id
    }

    /// Add a process with its (ready) task and link it under its parent.
    pub fn add_process(&mut self, mut proc: Process, task: Task) {
        let pid = proc.pid;
        let tid = task.tid;
        proc.tasks.push(tid);
        if let Some(parent) = self.procs.get_mut(&proc.ppid) {
            parent.children.push(pid);
        }
        crate::serial_println!("sched: added pid {} ({})", pid, proc.name);
        self.procs.insert(pid, proc);
        self.tasks.insert(tid, Box::new(task));
        self.make_ready(tid);
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn current_tid(&self) -> Option<Tid> {
        self.current
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current.and_then(|t| self.tasks.get(&t)).map(|t| t.pid)
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    pub fn task(&self, tid: Tid) -> Option<&Task> {
        self.tasks.get(&tid).map(|t| &**t)
    }

    pub fn task_mut(&mut self, tid: Tid) -> Option<&mut Task> {
        self.tasks.get_mut(&tid).map(|t| &mut **t)
    }

    /// The running process and task together.
    pub fn current_mut(&mut self) -> Option<(&mut Process, &mut Task)> {
        let task = self.tasks.get_mut(&self.current?)?;
        let proc = self.procs.get_mut(&task.pid)?;
        Some((proc, &mut **task))
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.keys().copied().collect()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    // ========================================================================
    // Run queue
    // ========================================================================

    pub fn make_ready(&mut self, tid: Tid) {
        if let Some(task) = self.tasks.get_mut(&tid) {
            if matches!(task.state, TaskState::Exited | TaskState::Running) {
                return;
            }
            task.state = TaskState::Ready;
            if !self.ready.contains(&tid) {
                self.ready.push_back(tid);
            }
        }
    }

    pub fn block_current(&mut self, chan: WaitChannel) {
        if let Some(task) = self.current.and_then(|t| self.tasks.get_mut(&t)) {
            task.state = TaskState::Blocked(chan);
            self.need_resched = true;
        }
    }

    /// Wake every task waiting on `chan`.
    pub fn wake(&mut self, chan: WaitChannel) -> usize {
        let waiting: Vec<Tid> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Blocked(chan))
            .map(|t| t.tid)
            .collect();
        for &tid in &waiting {
            self.make_ready(tid);
        }
        waiting.len()
    }

    /// Timer tick; true once the running task has used up its quantum.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        if self.current.is_none() {
            return !self.ready.is_empty();
        }
        self.slice_left = self.slice_left.saturating_sub(1);
        if self.slice_left == 0 {
            self.need_resched = true;
        }
        self.need_resched
    }

    pub fn request_resched(&mut self) {
        self.need_resched = true;
    }

    /// Must the trap exit path call `schedule()`?
    pub fn needs_resched(&self) -> bool {
        if self.need_resched {
            return true;
        }
        match self.current.and_then(|t| self.tasks.get(&t)) {
            Some(task) => !task.state.is_runnable(),
            None => !self.ready.is_empty(),
        }
    }

    /// Pick the next task round-robin.  `None` means keep running what is
    /// running now.
    pub fn schedule(&mut self) -> Option<Switch> {
        self.need_resched = false;
        self.slice_left = self.quantum;
        let prev = self.current;

        if let Some(task) = prev.and_then(|t| self.tasks.get_mut(&t)) {
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
                self.ready.push_back(task.tid);
            }
        }

        let next = loop {
            match self.ready.pop_front() {
                Some(tid) if self.tasks.get(&tid).is_some_and(|t| t.state == TaskState::Ready) => break Some(tid),
                Some(_) => continue,
                None => break None,
            }
        };

        self.current = next;
        let old: *mut Context = match prev.and_then(|t| self.tasks.get_mut(&t)) {
            Some(task) => &mut task.context,
            None => &mut *self.idle,
        };

        let Some(next) = next else {
            if prev.is_none() {
                return None;
            }
            if let Some(root) = self.kernel_root {
                arch::activate_root(root);
            }
            return Some(Switch { old, new: &*self.idle, kernel_stack_top: 0 });
        };

        let task = self.tasks.get_mut(&next)?;
        task.state = TaskState::Running;
        if let Some(mm) = self.procs.get(&task.pid).and_then(|p| p.mm.as_ref()) {
            mm.activate();
        }
        if prev == Some(next) {
            return None;
        }
        crate::serial_trace!("sched: switch {:?} -> {}", prev, next);
        Some(Switch { old, new: &task.context, kernel_stack_top: task.kstack.top() })
    }

    // ========================================================================
    // Signals, stop / continue
    // ========================================================================

    fn set_tasks(&mut self, pid: Pid, f: impl Fn(TaskState) -> Option<TaskState>) {
        let tids = self.procs.get(&pid).map(|p| p.tasks.clone()).unwrap_or_default();
        for tid in tids {
            let Some(task) = self.tasks.get_mut(&tid) else { continue };
            if let Some(state) = f(task.state) {
                task.state = state;
                if state == TaskState::Ready {
                    self.make_ready(tid);
                } else {
                    self.ready.retain(|&t| t != tid);
                }
            }
        }
    }

    /// Raise `sig` in `pid`.  Blocked tasks are woken so the signal gets
    /// handled (their system call restarts afterwards).
    pub fn send_signal(&mut self, pid: Pid, sig: u32) -> Result<(), Errno> {
        let proc = self.procs.get_mut(&pid).filter(|p| !p.is_zombie()).ok_or(Errno::ESRCH)?;
        if sig == 0 {
            return Ok(());
        }
        if !signal::valid_signal(sig) {
            return Err(Errno::EINVAL);
        }
        proc.signals.post(sig);
        let deliverable = proc.signals.has_deliverable();
        if sig == SIGCONT || sig == SIGKILL {
            self.continue_process(pid);
        }
        if deliverable {
            self.set_tasks(pid, |s| match s {
                TaskState::Blocked(_) => Some(TaskState::Ready),
                _ => None,
            });
        }
        Ok(())
    }

    pub fn stop_process(&mut self, pid: Pid) {
        if let Some(p) = self.procs.get_mut(&pid).filter(|p| !p.is_zombie()) {
            p.state = ProcessState::Stopped;
        }
        self.set_tasks(pid, |s| match s {
            TaskState::Ready | TaskState::Running | TaskState::Blocked(_) => Some(TaskState::Stopped),
            _ => None,
        });
        if self.current_pid() == Some(pid) {
            self.need_resched = true;
        }
    }

    pub fn continue_process(&mut self, pid: Pid) {
        match self.procs.get_mut(&pid) {
            Some(p) if p.state == ProcessState::Stopped => p.state = ProcessState::Alive,
            _ => return,
        }
        self.set_tasks(pid, |s| (s == TaskState::Stopped).then_some(TaskState::Ready));
    }

    // ========================================================================
    // Exit and reaping
    // ========================================================================

    /// Turn `pid` into a zombie: release its memory and files, hand its
    /// children to init and notify the parent.
    pub fn exit_process(&mut self, pid: Pid, status: ExitStatus) {
        let is_current = self.current_pid() == Some(pid);
        let Some(proc) = self.procs.get_mut(&pid) else { return };
        if proc.is_zombie() {
            return;
        }
        crate::serial_println!("sched: pid {} exited: {:?}", pid, status);
        proc.state = ProcessState::Zombie;
        proc.exit_status = Some(status);
        let ppid = proc.ppid;
        let children = core::mem::take(&mut proc.children);
        let files = proc.files.close_all();
        if is_current {
            if let Some(root) = self.kernel_root {
                arch::activate_root(root);
            }
        }
        let mm = proc.mm.take();
        drop(mm);

        self.set_tasks(pid, |_| Some(TaskState::Exited));
        if is_current {
            self.need_resched = true;
        }

        let pipes: Vec<u64> = files.iter().filter(|f| f.is_pipe()).map(|f| f.inode().id()).collect();
        drop(files);
        for id in pipes {
            self.wake(WaitChannel::Pipe(id));
        }

        let mut zombie_orphans = false;
        for child in children {
            if let Some(c) = self.procs.get_mut(&child) {
                c.ppid = INIT_PID;
                zombie_orphans |= c.is_zombie();
                if let Some(init) = self.procs.get_mut(&INIT_PID) {
                    init.children.push(child);
                }
            }
        }
        if zombie_orphans {
            let _ = self.send_signal(INIT_PID, SIGCHLD);
            self.wake(WaitChannel::Child(INIT_PID));
        }
        if pid == INIT_PID {
            crate::serial_println!("sched: init exited");
        }

        let _ = self.send_signal(ppid, SIGCHLD);
        self.wake(WaitChannel::Child(ppid));
    }

    /// Reap one zombie child of `parent` matching `sel`.
    /// `Ok(None)`: matching children exist but none has exited yet.
    pub fn reap_child(&mut self, parent: Pid, sel: ChildSelector) -> Result<Option<(Pid, ExitStatus)>, Errno> {
        let children = self.procs.get(&parent).map(|p| p.children.clone()).ok_or(Errno::ESRCH)?;
        let matching: Vec<&Process> = children
            .iter()
            .filter_map(|c| self.procs.get(c))
            .filter(|c| match sel {
                ChildSelector::Any => true,
                ChildSelector::Pid(pid) => c.pid == pid,
                ChildSelector::Group(pgid) => c.pgid == pgid,
            })
            .collect();
        if matching.is_empty() {
            return Err(Errno::ECHILD);
        }
        let Some(zombie) = matching.iter().find(|c| c.is_zombie()).map(|c| c.pid) else {
            return Ok(None);
        };

        let proc = self.procs.remove(&zombie).ok_or(Errno::ECHILD)?;
        for tid in &proc.tasks {
            self.tasks.remove(tid);
            self.ready.retain(|t| t != tid);
        }
        if let Some(p) = self.procs.get_mut(&parent) {
            p.children.retain(|&c| c != zombie);
        }
        let status = proc.exit_status.unwrap_or(ExitStatus::Exited(0));
        Ok(Some((zombie, status)))
    }
}
