// kernel/src/process/signal.rs
//
// Per-process signal state and the user-stack signal frame.
//
// Pending signals are a bit set: raising a signal that is already pending
// changes nothing.  Delivery happens on the way back to user mode and
// picks the lowest-numbered pending signal that is not blocked (SIGKILL
// and SIGSTOP are never blocked).  A caught signal gets a `SignalFrame`
// pushed on the user stack holding the interrupted trap frame and mask;
// `sigreturn` reads it back and resumes exactly where the trap happened.

use core::mem::{offset_of, size_of};

use crate::arch::{current, TrapFrame};
use crate::error::Errno;
use crate::memory::fault::FilePager;
use crate::memory::layout::SIGNAL_TRAMPOLINE;
use crate::memory::user_copy::UserMemory;
use crate::memory::AddressSpace;

pub const NSIG: usize = 32;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGURG: u32 = 23;
pub const SIGWINCH: u32 = 28;

/// Handler values with special meaning.
pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

pub const SA_SIGINFO: u64 = 0x0000_0004;
pub const SA_RESTORER: u64 = 0x0400_0000;
pub const SA_NODEFER: u64 = 0x4000_0000;
pub const SA_RESETHAND: u64 = 0x8000_0000;

pub const SIG_BLOCK: u64 = 0;
pub const SIG_UNBLOCK: u64 = 1;
pub const SIG_SETMASK: u64 = 2;

/// Marks a genuine signal frame ("SIGFRAME").
const FRAME_MAGIC: u64 = 0x5349_4746_5241_4d45;

/// Below the interrupted stack pointer that user code may still be using.
const RED_ZONE: u64 = 128;

// ============================================================================
// Signal sets
// ============================================================================

/// Linux-layout signal set: bit `n - 1` is signal `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(pub u64);

impl SigSet {
    pub const fn empty() -> Self {
        SigSet(0)
    }

    pub fn of(sig: u32) -> Self {
        SigSet(1 << (sig - 1))
    }

    pub fn contains(self, sig: u32) -> bool {
        self.0 & (1 << (sig - 1)) != 0
    }

    pub fn insert(&mut self, sig: u32) {
        self.0 |= 1 << (sig - 1);
    }

    pub fn remove(&mut self, sig: u32) {
        self.0 &= !(1 << (sig - 1));
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Drop the signals no mask may hold.
    pub fn sanitized(self) -> Self {
        SigSet(self.0 & !(Self::of(SIGKILL).0 | Self::of(SIGSTOP).0) & ((1 << (NSIG - 1)) - 1))
    }
}

pub fn valid_signal(sig: u32) -> bool {
    sig >= 1 && (sig as usize) < NSIG
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    /// Terminate, reporting a core dump in the wait status.
    Core,
    Stop,
    Continue,
}

pub fn default_action(sig: u32) -> DefaultAction {
    match sig {
        SIGCHLD | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGCONT => DefaultAction::Continue,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV => DefaultAction::Core,
        _ => DefaultAction::Terminate,
    }
}

/// `struct sigaction` as the kernel ABI lays it out.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigAction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: SigSet,
}

impl SigAction {
    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    pub fn is_ignore(&self) -> bool {
        self.handler == SIG_IGN
    }
}

/// What delivering one signal comes down to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignore,
    Terminate { core: bool },
    Stop,
    Continue,
    Catch(SigAction),
}

#[derive(Debug, Clone)]
pub struct SignalState {
    pub pending: SigSet,
    pub blocked: SigSet,
    actions: [SigAction; NSIG],
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    pub fn new() -> Self {
        Self { pending: SigSet::empty(), blocked: SigSet::empty(), actions: [SigAction::default(); NSIG] }
    }

    /// State a forked child starts with: handlers and mask inherited,
    /// nothing pending.
    pub fn fork_copy(&self) -> Self {
        Self { pending: SigSet::empty(), ..self.clone() }
    }

    pub fn action(&self, sig: u32) -> SigAction {
        self.actions[sig as usize]
    }

    /// Install a handler, returning the previous one.
    pub fn set_action(&mut self, sig: u32, act: SigAction) -> Result<SigAction, Errno> {
        if !valid_signal(sig) || sig == SIGKILL || sig == SIGSTOP {
            return Err(Errno::EINVAL);
        }
        let old = self.actions[sig as usize];
        self.actions[sig as usize] = SigAction { mask: act.mask.sanitized(), ..act };
        Ok(old)
    }

    /// Record `sig` as pending.  Stop and continue signals cancel each other.
    pub fn post(&mut self, sig: u32) {
        match sig {
            SIGCONT => {
                for s in [SIGSTOP, SIGTSTP, SIGTTIN, SIGTTOU] {
                    self.pending.remove(s);
                }
            }
            SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => self.pending.remove(SIGCONT),
            _ => {}
        }
        self.pending.insert(sig);
    }

    /// `sigprocmask`; returns the old mask.
    pub fn change_mask(&mut self, how: u64, set: SigSet) -> Result<SigSet, Errno> {
        let old = self.blocked;
        self.blocked = match how {
            SIG_BLOCK => SigSet(old.0 | set.0),
            SIG_UNBLOCK => SigSet(old.0 & !set.0),
            SIG_SETMASK => set,
            _ => return Err(Errno::EINVAL),
        }
        .sanitized();
        Ok(old)
    }

    /// Anything deliverable right now?
    pub fn has_deliverable(&self) -> bool {
        !SigSet(self.pending.0 & !self.blocked.sanitized().0).is_empty()
    }

    /// Take the lowest-numbered deliverable signal off the pending set.
    pub fn dequeue(&mut self) -> Option<u32> {
        let ready = self.pending.0 & !self.blocked.sanitized().0;
        if ready == 0 {
            return None;
        }
        let sig = ready.trailing_zeros() + 1;
        self.pending.remove(sig);
        Some(sig)
    }

    pub fn disposition(&self, sig: u32) -> Disposition {
        let act = self.actions[sig as usize];
        if sig == SIGKILL {
            return Disposition::Terminate { core: false };
        }
        if sig == SIGSTOP {
            return Disposition::Stop;
        }
        if act.is_ignore() {
            return Disposition::Ignore;
        }
        if !act.is_default() {
            return Disposition::Catch(act);
        }
        match default_action(sig) {
            DefaultAction::Terminate => Disposition::Terminate { core: false },
            DefaultAction::Core => Disposition::Terminate { core: true },
            DefaultAction::Ignore => Disposition::Ignore,
            DefaultAction::Stop => Disposition::Stop,
            DefaultAction::Continue => Disposition::Continue,
        }
    }

    /// exec: caught signals revert to default, ignored ones stay ignored.
    pub fn reset_for_exec(&mut self) {
        for act in self.actions.iter_mut() {
            if !act.is_ignore() {
                *act = SigAction::default();
            }
        }
    }

    /// Bookkeeping at handler entry: the signal (unless `SA_NODEFER`) and
    /// the handler's mask are blocked; `SA_RESETHAND` is one-shot.
    fn enter_handler(&mut self, sig: u32, act: &SigAction) {
        let mut mask = SigSet(self.blocked.0 | act.mask.0);
        if act.flags & SA_NODEFER == 0 {
            mask.insert(sig);
        }
        self.blocked = mask.sanitized();
        if act.flags & SA_RESETHAND != 0 {
            self.actions[sig as usize] = SigAction::default();
        }
    }
}

// ============================================================================
// Signal frame
// ============================================================================

/// Pushed on the user stack at handler entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalFrame {
    /// Return address the handler's `ret` pops (x86); unused on arm64.
    pub ret_addr: u64,
    pub magic: u64,
    pub signo: u64,
    pub saved_mask: u64,
    pub info: SigInfo,
    pub tf: TrapFrame,
}

/// Head of a `siginfo_t`, handed to the handler as its second argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub errno: i32,
    pub code: i32,
    _pad: i32,
}

const FRAME_SIZE: usize = size_of::<SignalFrame>();

impl SignalFrame {
    fn to_bytes(self) -> [u8; FRAME_SIZE] {
        // SAFETY: plain-old-data, repr(C), no padding (u64 and paired i32 fields).
        unsafe { core::mem::transmute::<SignalFrame, [u8; FRAME_SIZE]>(self) }
    }

    fn from_bytes(bytes: [u8; FRAME_SIZE]) -> Self {
        // SAFETY: every bit pattern is a valid SignalFrame.
        unsafe { core::mem::transmute::<[u8; FRAME_SIZE], SignalFrame>(bytes) }
    }
}

/// Where the frame goes for an interrupted stack pointer `sp`; `None` if
/// it would wrap below address zero.
fn frame_address(sp: u64) -> Option<u64> {
    let base = sp.checked_sub(RED_ZONE + FRAME_SIZE as u64)? & !0xf;
    // x86 enters the handler as if just called: sp % 16 == 8.
    if current::RETURN_ADDRESS_ON_STACK {
        base.checked_sub(8)
    } else {
        Some(base)
    }
}

/// Build a signal frame for `sig` on the user stack and point `tf` at the
/// handler.  On failure nothing in `state` or `tf` has changed.
pub fn setup_frame(
    mm: &mut AddressSpace,
    pager: &dyn FilePager,
    tf: &mut TrapFrame,
    state: &mut SignalState,
    sig: u32,
    act: &SigAction,
) -> Result<(), Errno> {
    let ret = if act.flags & SA_RESTORER != 0 && act.restorer != 0 {
        act.restorer
    } else {
        SIGNAL_TRAMPOLINE
    };
    let addr = frame_address(tf.sp()).ok_or(Errno::EFAULT)?;
    let frame = SignalFrame {
        ret_addr: ret,
        magic: FRAME_MAGIC,
        signo: sig as u64,
        saved_mask: state.blocked.0,
        info: SigInfo { signo: sig as i32, ..SigInfo::default() },
        tf: *tf,
    };
    UserMemory::new(mm, pager).write(addr, &frame.to_bytes())?;

    state.enter_handler(sig, act);
    // handler(signo, siginfo, ucontext): the last two point into the frame
    let info = addr + offset_of!(SignalFrame, info) as u64;
    tf.enter_handler(act.handler, [sig as u64, info, addr], addr, ret);
    crate::serial_trace!("signal: {} -> handler {:#x}, frame {:#x}", sig, act.handler, addr);
    Ok(())
}

/// Undo `setup_frame`: restore the saved registers and mask.  A missing or
/// corrupt frame is `EFAULT` and the caller kills the process.
pub fn restore_frame(
    mm: &mut AddressSpace,
    pager: &dyn FilePager,
    tf: &mut TrapFrame,
    state: &mut SignalState,
) -> Result<(), Errno> {
    // x86: the handler's `ret` already popped `ret_addr`
    let addr = if current::RETURN_ADDRESS_ON_STACK {
        tf.sp().checked_sub(8).ok_or(Errno::EFAULT)?
    } else {
        tf.sp()
    };
    let mut bytes = [0u8; FRAME_SIZE];
    UserMemory::new(mm, pager).read(addr, &mut bytes)?;
    let frame = SignalFrame::from_bytes(bytes);
    if frame.magic != FRAME_MAGIC {
        return Err(Errno::EFAULT);
    }
    let mut restored = frame.tf;
    restored.sanitize_user();
    *tf = restored;
    state.blocked = SigSet(frame.saved_mask).sanitized();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::memory::fault::NoPager;
    use crate::memory::layout::USER_STACK_TOP;
    use crate::memory::FramePool;

    #[test]
    fn lowest_unblocked_first_and_kill_ignores_mask() {
        let mut s = SignalState::new();
        s.post(SIGTERM);
        s.post(SIGUSR1);
        s.post(SIGUSR1);
        s.blocked = SigSet::of(SIGUSR1);
        assert_eq!(s.dequeue(), Some(SIGTERM));
        assert_eq!(s.dequeue(), None);

        s.blocked = SigSet(!0);
        s.post(SIGKILL);
        assert_eq!(s.dequeue(), Some(SIGKILL));
    }

    #[test]
    fn kill_and_stop_cannot_be_caught_or_blocked() {
        let mut s = SignalState::new();
        let act = SigAction { handler: 0x4000, ..SigAction::default() };
        assert_eq!(s.set_action(SIGKILL, act), Err(Errno::EINVAL));
        assert_eq!(s.set_action(SIGSTOP, act), Err(Errno::EINVAL));
        s.change_mask(SIG_SETMASK, SigSet(!0)).unwrap();
        assert!(!s.blocked.contains(SIGKILL));
        assert!(!s.blocked.contains(SIGSTOP));
    }

    #[test]
    fn stop_and_continue_cancel() {
        let mut s = SignalState::new();
        s.post(SIGTSTP);
        s.post(SIGCONT);
        assert!(!s.pending.contains(SIGTSTP));
        s.post(SIGSTOP);
        assert!(!s.pending.contains(SIGCONT));
    }

    #[test]
    fn exec_keeps_ignored_handlers() {
        let mut s = SignalState::new();
        s.set_action(SIGINT, SigAction { handler: SIG_IGN, ..Default::default() }).unwrap();
        s.set_action(SIGUSR1, SigAction { handler: 0x4000, ..Default::default() }).unwrap();
        s.reset_for_exec();
        assert!(s.action(SIGINT).is_ignore());
        assert!(s.action(SIGUSR1).is_default());
    }

    #[test]
    fn frame_round_trip_restores_registers_and_mask() {
        let pool = FramePool::new_heap_backed(32);
        let mut mm = AddressSpace::new_user(pool, None, &KernelConfig::default()).unwrap();
        let mut s = SignalState::new();
        s.blocked = SigSet::of(SIGUSR2);
        let act = SigAction { handler: 0x40_1000, mask: SigSet::of(SIGINT), ..Default::default() };
        s.set_action(SIGUSR1, act).unwrap();

        let mut tf = TrapFrame::new_user(0x40_0123, USER_STACK_TOP - 0x100);
        tf.set_return(77);
        let before = tf;

        setup_frame(&mut mm, &NoPager, &mut tf, &mut s, SIGUSR1, &act).unwrap();
        assert_eq!(tf.pc(), 0x40_1000);
        assert!(s.blocked.contains(SIGUSR1) && s.blocked.contains(SIGINT));
        let args = tf.syscall_args();
        assert_eq!(args[1], args[2] + offset_of!(SignalFrame, info) as u64);
        assert_eq!(UserMemory::new(&mut mm, &NoPager).read_u32(args[1]), Ok(SIGUSR1));
        if current::RETURN_ADDRESS_ON_STACK {
            assert_eq!(tf.sp() % 16, 8);
            // emulate the handler's `ret`
            tf.set_sp(tf.sp() + 8);
        }

        restore_frame(&mut mm, &NoPager, &mut tf, &mut s).unwrap();
        assert_eq!(tf, before);
        assert_eq!(s.blocked, SigSet::of(SIGUSR2));
    }

    #[test]
    fn corrupt_frame_is_rejected() {
        let pool = FramePool::new_heap_backed(32);
        let mut mm = AddressSpace::new_user(pool, None, &KernelConfig::default()).unwrap();
        let mut s = SignalState::new();
        let mut tf = TrapFrame::new_user(0x40_0000, USER_STACK_TOP - 0x800);
        assert_eq!(restore_frame(&mut mm, &NoPager, &mut tf, &mut s), Err(Errno::EFAULT));
    }

    #[test]
    fn stack_pointer_near_zero_is_a_fault() {
        let pool = FramePool::new_heap_backed(32);
        let mut mm = AddressSpace::new_user(pool, None, &KernelConfig::default()).unwrap();
        let mut s = SignalState::new();
        let act = SigAction { handler: 0x40_1000, ..Default::default() };
        let mut tf = TrapFrame::new_user(0x40_0000, 0x40);
        let before = tf;
        assert_eq!(setup_frame(&mut mm, &NoPager, &mut tf, &mut s, SIGUSR1, &act), Err(Errno::EFAULT));
        assert_eq!(tf, before);
        assert!(s.blocked.is_empty());

        tf.set_sp(4);
        assert_eq!(restore_frame(&mut mm, &NoPager, &mut tf, &mut s), Err(Errno::EFAULT));
    }
}
