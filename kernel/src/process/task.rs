// kernel/src/process/task.rs
//
// A task: one schedulable thread of control.  It owns a kernel stack, the
// callee-saved context `switch_context` saves and loads, and a copy of the
// user register state taken at the last trap.
//
// The trap frame is a value: the trap entry stores it here, system calls
// and signal delivery edit this copy, and the trap exit writes it back to
// the kernel stack before returning to user mode.

use alloc::sync::Arc;
use core::mem::size_of;

use super::{Pid, Tid};
use crate::arch::{Context, TrapFrame};
use crate::memory::{FramePool, PhysFrame, PAGE_SIZE};

/// Frames per kernel stack.
pub const KSTACK_PAGES: usize = 4;

/// Something a blocked task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    /// A child of this process changing state.
    Child(Pid),
    /// Data or room in a pipe (keyed by inode id).
    Pipe(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked(WaitChannel),
    Stopped,
    /// Finished; stays around until its process is reaped.
    Exited,
}

impl TaskState {
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Running)
    }
}

// ============================================================================
// Kernel stack
// ============================================================================

pub struct KernelStack {
    pool: Arc<FramePool>,
    base: PhysFrame,
}

impl KernelStack {
    pub fn new(pool: Arc<FramePool>) -> Option<Self> {
        let base = pool.alloc_contiguous(KSTACK_PAGES)?;
        Some(Self { pool, base })
    }

    /// Lowest address of the stack (kernel virtual).
    pub fn bottom(&self) -> u64 {
        self.pool.phys_to_virt(self.base.start_address()) as u64
    }

    pub fn top(&self) -> u64 {
        self.bottom() + (KSTACK_PAGES as u64) * PAGE_SIZE
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.bottom() && addr < self.top()
    }

    /// Where a fresh task's trap frame sits.
    pub fn initial_frame_sp(&self) -> u64 {
        self.top() - size_of::<TrapFrame>() as u64
    }

    /// A new stack with the same contents.
    pub fn duplicate(&self) -> Option<Self> {
        let copy = Self::new(self.pool.clone())?;
        for i in 0..KSTACK_PAGES as u64 {
            let src = PhysFrame::containing_address(self.base.start_address() + i * PAGE_SIZE);
            let dst = PhysFrame::containing_address(copy.base.start_address() + i * PAGE_SIZE);
            self.pool.copy_frame(dst, src);
        }
        Some(copy)
    }

    /// `addr` on `other` moved to the same offset on this stack.
    pub fn relocate(&self, other: &KernelStack, addr: u64) -> u64 {
        if other.contains(addr) {
            addr - other.bottom() + self.bottom()
        } else {
            self.initial_frame_sp()
        }
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        self.pool.free_contiguous(self.base, KSTACK_PAGES);
    }
}

// ============================================================================
// Task
// ============================================================================

pub struct Task {
    pub tid: Tid,
    pub pid: Pid,
    pub state: TaskState,
    pub context: Context,
    pub kstack: KernelStack,
    pub trapframe: TrapFrame,
    /// Kernel stack address of the trap frame of the trap in progress.
    pub trap_sp: u64,
}

impl Task {
    /// A task that enters user mode with `trapframe` through `entry` (the
    /// trap-return trampoline of the boot code).
    pub fn new(tid: Tid, pid: Pid, kstack: KernelStack, trapframe: TrapFrame, entry: u64) -> Self {
        let sp = kstack.initial_frame_sp();
        Self {
            tid,
            pid,
            state: TaskState::Ready,
            context: Context::new_task(entry, sp),
            kstack,
            trapframe,
            trap_sp: sp,
        }
    }

    /// fork: clone the kernel stack verbatim and resume the child at the
    /// same stack depth, with 0 as its system-call result.
    pub fn fork(&self, tid: Tid, pid: Pid, entry: u64) -> Option<Self> {
        let kstack = self.kstack.duplicate()?;
        let sp = kstack.relocate(&self.kstack, self.trap_sp);
        let mut trapframe = self.trapframe;
        trapframe.set_return(0);
        Some(Self {
            tid,
            pid,
            state: TaskState::Ready,
            context: Context::new_task(entry, sp),
            kstack,
            trapframe,
            trap_sp: sp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forked_stack_is_a_relocated_copy() {
        let pool = FramePool::new_heap_backed(16);
        let parent_stack = KernelStack::new(pool.clone()).unwrap();
        let mut tf = TrapFrame::new_user(0x1000, 0x2000);
        tf.set_return(42);
        let mut parent = Task::new(1, 1, parent_stack, tf, 0xdead);
        parent.trap_sp = parent.kstack.top() - 0x200;
        let marker = parent.trap_sp - parent.kstack.bottom();
        unsafe { *((parent.kstack.bottom() + marker) as *mut u64) = 0x5a5a };

        let child = parent.fork(2, 2, 0xdead).unwrap();
        assert_eq!(child.trap_sp - child.kstack.bottom(), marker);
        assert_eq!(child.context.sp(), child.trap_sp);
        assert_eq!(unsafe { *(child.trap_sp as *const u64) }, 0x5a5a);
        assert_eq!(child.trapframe.pc(), 0x1000);
        assert_ne!(child.trapframe, parent.trapframe);

        let free = pool.free_count();
        drop(child);
        assert_eq!(pool.free_count(), free + KSTACK_PAGES);
    }
}
