// kernel/src/kernel.rs
//
// The kernel proper: the frame pool, the VFS and the scheduler, plus the
// entry points the trap code calls.
//
// A trap runs as:
//
//   enter_trap(frame)            copy the user registers into the task
//   syscall() / page_fault() / timer_tick()
//   loop { finish_trap() }       reschedule and deliver signals; every
//                                returned `Switch` is carried out by the
//                                caller with the scheduler lock released
//   current_frame()              registers to return to user mode with
//
// Everything runs under the scheduler lock; the page cache lock nests
// inside it.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::TrapFrame;
use crate::config::KernelConfig;
use crate::error::Errno;
use crate::fs::{FdTable, Inode, OpenFlags, Vfs};
use crate::memory::fault::{handle_fault, Access, FaultError, Resolution};
use crate::memory::user_copy::UserMemory;
use crate::memory::FramePool;
use crate::process::exec::Loader;
use crate::process::signal::{self, Disposition, SigAction, SIGSEGV};
use crate::process::{Credentials, ExitStatus, KernelStack, Pid, Process, Scheduler, Switch, Task};
use crate::sync::IrqLock;
use crate::syscall::{self, Outcome, SyscallCtx};

pub struct Kernel {
    pool: Arc<FramePool>,
    vfs: Vfs,
    sched: IrqLock<Scheduler>,
    config: KernelConfig,
    /// Page-table root used while no process is active (x86 shares its
    /// upper half into every user table).
    kernel_root: Option<u64>,
    /// Kernel-mode entry point of a new task (the trap-return trampoline).
    task_entry: u64,
}

impl Kernel {
    pub fn new(
        pool: Arc<FramePool>,
        root: Arc<Inode>,
        config: KernelConfig,
        kernel_root: Option<u64>,
        task_entry: u64,
    ) -> Self {
        let vfs = Vfs::new(root, pool.clone(), &config);
        let sched = IrqLock::new(Scheduler::new(config.quantum_ticks, kernel_root));
        Self { pool, vfs, sched, config, kernel_root, task_entry }
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn task_entry(&self) -> u64 {
        self.task_entry
    }

    pub fn scheduler(&self) -> &IrqLock<Scheduler> {
        &self.sched
    }

    pub fn loader(&self) -> Loader<'_> {
        Loader { vfs: &self.vfs, pool: &self.pool, cfg: &self.config, kernel_root: self.kernel_root }
    }

    /// Start `path` as a new parentless process with descriptors 0-2 on
    /// the console (when there is one).  This is how init comes to life.
    pub fn spawn(&self, path: &str, argv: &[&str]) -> Result<Pid, Errno> {
        let argv: Vec<String> = argv.iter().map(|s| String::from(*s)).collect();
        let image = self.loader().prepare("/", path, &argv, &[], Credentials::default())?;

        let mut files = FdTable::new(self.config.max_open_files);
        if let Ok(console) = self.vfs.open("/", "/dev/console", OpenFlags::RDWR, 0) {
            for _ in 0..3 {
                files.alloc(console.clone(), false)?;
            }
        }
        let kstack = KernelStack::new(self.pool.clone()).ok_or(Errno::ENOMEM)?;

        let mut sched = self.sched.lock();
        let pid = sched.alloc_id();
        let mut proc = Process::new(pid, 0, image.mm, files);
        proc.set_name(&image.name);
        let task = Task::new(pid, pid, kstack, TrapFrame::new_user(image.entry, image.sp), self.task_entry);
        sched.add_process(proc, task);
        Ok(pid)
    }

    // ========================================================================
    // Trap entry points
    // ========================================================================

    /// Save the user registers of the trap being handled.
    pub fn enter_trap(&self, frame: &TrapFrame, trap_sp: u64) {
        if !frame.from_user() {
            return;
        }
        let mut sched = self.sched.lock();
        if let Some((_, task)) = sched.current_mut() {
            task.trapframe = *frame;
            task.trap_sp = trap_sp;
        }
    }

    /// Run the system call described by the current task's registers.
    pub fn syscall(&self) {
        let mut sched = self.sched.lock();
        let Some(tid) = sched.current_tid() else { return };
        let Some(frame) = sched.task(tid).map(|t| t.trapframe) else { return };

        let outcome = {
            let mut cx = SyscallCtx { kernel: self, sched: &mut sched };
            syscall::dispatch(&mut cx, frame.syscall_number(), frame.syscall_args())
        };
        if let Outcome::Return(value) = outcome {
            if let Some(task) = sched.task_mut(tid) {
                task.trapframe.set_return(value);
            }
        }
    }

    /// A user-mode page fault.  Unresolvable faults raise SIGSEGV.
    pub fn page_fault(&self, addr: u64, access: Access) -> Result<Resolution, FaultError> {
        let mut sched = self.sched.lock();
        let (proc, task) = sched.current_mut().ok_or(FaultError::NoVma)?;
        let pid = proc.pid;
        let pc = task.trapframe.pc();
        let mm = proc.mm.as_mut().ok_or(FaultError::NoVma)?;
        match handle_fault(mm, &self.vfs, addr, access) {
            Ok(r) => Ok(r),
            Err(e) => {
                crate::serial_println!("fault: pid {} {:?} at {:#x} (pc {:#x}): {:?}", pid, access, addr, pc, e);
                force_signal(&mut sched, pid, SIGSEGV);
                Err(e)
            }
        }
    }

    pub fn timer_tick(&self) {
        self.sched.lock().tick();
    }

    /// Next step on the way out of a trap.  `Some` is a context switch the
    /// caller must perform before calling again; `None` means return with
    /// `current_frame()`.
    pub fn finish_trap(&self) -> Option<Switch> {
        let mut sched = self.sched.lock();
        if sched.needs_resched() {
            if let Some(switch) = sched.schedule() {
                return Some(switch);
            }
        }
        self.deliver_signals(&mut sched);
        if sched.needs_resched() {
            return sched.schedule();
        }
        None
    }

    /// User registers the current task resumes with.
    pub fn current_frame(&self) -> Option<TrapFrame> {
        let sched = self.sched.lock();
        let tid = sched.current_tid()?;
        sched.task(tid).map(|t| t.trapframe)
    }

    /// Act on pending signals of the current process: at most one handler
    /// frame is set up per trap exit.
    fn deliver_signals(&self, sched: &mut Scheduler) {
        let Some(pid) = sched.current_pid() else { return };
        loop {
            let Some((proc, task)) = sched.current_mut() else { return };
            if proc.is_zombie() {
                return;
            }
            let Some(sig) = proc.signals.dequeue() else { return };
            match proc.signals.disposition(sig) {
                Disposition::Ignore | Disposition::Continue => continue,
                Disposition::Terminate { core } => {
                    sched.exit_process(pid, ExitStatus::Signaled { sig, core });
                    return;
                }
                Disposition::Stop => {
                    crate::serial_println!("signal: pid {} stopped by {}", pid, sig);
                    sched.stop_process(pid);
                    return;
                }
                Disposition::Catch(act) => {
                    let Some(mm) = proc.mm.as_mut() else { return };
                    let res = signal::setup_frame(mm, &self.vfs, &mut task.trapframe, &mut proc.signals, sig, &act);
                    if let Err(e) = res {
                        crate::serial_println!("signal: pid {} cannot take {}: {:?}", pid, sig, e);
                        sched.exit_process(pid, ExitStatus::Signaled { sig: SIGSEGV, core: true });
                    }
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Hosted drivers for the trap path
    // ========================================================================

    /// Act as the current task issuing system call `nr`, the way the trap
    /// code would, and return the result register.  `None` without a
    /// current task.
    pub fn issue_syscall(&self, nr: u64, args: [u64; 6]) -> Option<i64> {
        let tid = self.with_current(|_, task| {
            let pc = task.trapframe.pc();
            task.trapframe.set_syscall(nr, args);
            task.trapframe.set_pc(pc + crate::arch::current::SYSCALL_INSN_LEN);
            task.tid
        })?;
        self.syscall();
        let sched = self.sched.lock();
        sched.task(tid).map(|t| t.trapframe.return_value())
    }

    /// Run `f` on the current process and task.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Process, &mut Task) -> R) -> Option<R> {
        let mut sched = self.sched.lock();
        sched.current_mut().map(|(p, t)| f(p, t))
    }

    /// Run `f` on the current process's memory.
    pub fn with_user_memory<R>(&self, f: impl FnOnce(&mut UserMemory) -> R) -> Option<R> {
        let mut sched = self.sched.lock();
        let (proc, _) = sched.current_mut()?;
        let mm = proc.mm.as_mut()?;
        Some(f(&mut UserMemory::new(mm, &self.vfs)))
    }

    /// Keep calling `finish_trap` until a task is selected, ignoring the
    /// switches (there is no second stack to run on when hosted).
    pub fn settle(&self) {
        while self.finish_trap().is_some() {}
    }
}

/// Raise a signal the process cannot escape: blocked or ignored, it is
/// reset to the default action first.
pub fn force_signal(sched: &mut Scheduler, pid: Pid, sig: u32) {
    if let Some(p) = sched.process_mut(pid) {
        if p.signals.blocked.contains(sig) || p.signals.action(sig).is_ignore() {
            p.signals.blocked.remove(sig);
            let _ = p.signals.set_action(sig, SigAction::default());
        }
    }
    let _ = sched.send_signal(pid, sig);
}
