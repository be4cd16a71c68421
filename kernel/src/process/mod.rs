// kernel/src/process/mod.rs
//
// Processes and tasks.
//
// A process is an address space, a descriptor table, signal state,
// credentials and its place in the process tree.  Tasks are the
// schedulable units; every process here runs exactly one.  The scheduler
// owns both tables and hands out `&mut` access, so there are no global
// process lists.

use alloc::string::String;
use alloc::vec::Vec;

pub mod elf;
pub mod exec;
pub mod fork;
pub mod scheduler;
pub mod signal;
pub mod task;

pub use scheduler::{Scheduler, Switch};
pub use signal::{SigAction, SigSet, SignalState};
pub use task::{KernelStack, Task, TaskState, WaitChannel};

use crate::fs::FdTable;
use crate::memory::AddressSpace;

pub type Pid = u32;
pub type Tid = u32;

/// Pid of the first user process, adopter of orphans.
pub const INIT_PID: Pid = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    /// Stopped by a stop signal.
    Stopped,
    /// Exited, waiting for the parent to reap it.
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

impl Credentials {
    pub fn is_root(&self) -> bool {
        self.euid == 0
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled { sig: u32, core: bool },
}

impl ExitStatus {
    /// `wait4` status word.
    pub fn encode(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => (code & 0xff) << 8,
            ExitStatus::Signaled { sig, core } => (sig as i32 & 0x7f) | if core { 0x80 } else { 0 },
        }
    }
}

pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    pub creds: Credentials,
    pub state: ProcessState,
    /// `None` once the process has exited.
    pub mm: Option<AddressSpace>,
    pub files: FdTable,
    pub signals: SignalState,
    pub cwd: String,
    pub children: Vec<Pid>,
    pub tasks: Vec<Tid>,
    pub name: String,
    pub exit_status: Option<ExitStatus>,
}

impl Process {
    pub fn new(pid: Pid, ppid: Pid, mm: AddressSpace, files: FdTable) -> Self {
        Self {
            pid,
            ppid,
            pgid: pid,
            sid: pid,
            creds: Credentials::default(),
            state: ProcessState::Alive,
            mm: Some(mm),
            files,
            signals: SignalState::new(),
            cwd: String::from("/"),
            children: Vec::new(),
            tasks: Vec::new(),
            name: String::new(),
            exit_status: None,
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(name.rsplit('/').next().unwrap_or(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_encoding() {
        assert_eq!(ExitStatus::Exited(3).encode(), 0x300);
        assert_eq!(ExitStatus::Exited(-1).encode(), 0xff00);
        assert_eq!(ExitStatus::Signaled { sig: 11, core: true }.encode(), 0x8b);
        assert_eq!(ExitStatus::Signaled { sig: 9, core: false }.encode(), 9);
    }
}
