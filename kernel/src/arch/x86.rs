// kernel/src/arch/x86.rs
//
// x86_64 machine layer: 4-level paging entries, the trap frame pushed by
// the interrupt stubs, and the callee-saved context used for task switches.

use x86_64::structures::paging::PageTableFlags;

use super::PtePerms;

/// Kernel/user segment selectors as laid out by the boot GDT
/// (null, kcode, kdata, udata, ucode, tss).
pub const KERNEL_CS: u64 = 0x08;
pub const USER_DS: u64 = 0x18 | 3;
pub const USER_CS: u64 = 0x20 | 3;

const RFLAGS_IF: u64 = 1 << 9;
const RFLAGS_IOPL: u64 = 3 << 12;

/// `int 0x80` is two bytes long.
pub const SYSCALL_INSN_LEN: u64 = 2;

/// The handler's return address goes on the user stack (`call` ABI).
pub const RETURN_ADDRESS_ON_STACK: bool = true;

/// `mov eax, 15 ; int 0x80 ; ud2` (rt_sigreturn).
pub const SIGRETURN_TRAMPOLINE: &[u8] = &[0xb8, 0x0f, 0x00, 0x00, 0x00, 0xcd, 0x80, 0x0f, 0x0b];

// ============================================================================
// Page table entry
// ============================================================================

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const COW: PageTableFlags = PageTableFlags::BIT_9;

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    fn with_flags(self, flags: PageTableFlags) -> Self {
        Self((self.0 & ADDR_MASK) | flags.bits())
    }

    /// Non-leaf entry.  Intermediate levels stay permissive; the leaf decides.
    pub fn new_table(phys: u64) -> Self {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        Self((phys & ADDR_MASK) | flags.bits())
    }

    pub fn new_page(phys: u64, perms: PtePerms) -> Self {
        let mut flags = PageTableFlags::PRESENT;
        if perms.contains(PtePerms::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if perms.contains(PtePerms::USER) {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if !perms.contains(PtePerms::EXEC) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        Self((phys & ADDR_MASK) | flags.bits())
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn is_table(self) -> bool {
        self.is_valid() && !self.flags().contains(PageTableFlags::HUGE_PAGE)
    }

    pub fn addr(self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PageTableFlags::WRITABLE)
    }

    pub fn is_executable(self) -> bool {
        !self.flags().contains(PageTableFlags::NO_EXECUTE)
    }

    pub fn is_user(self) -> bool {
        self.flags().contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn is_cow(self) -> bool {
        self.flags().contains(COW)
    }

    pub fn with_writable(self, writable: bool) -> Self {
        let mut f = self.flags();
        f.set(PageTableFlags::WRITABLE, writable);
        self.with_flags(f)
    }

    pub fn with_cow(self, cow: bool) -> Self {
        let mut f = self.flags();
        f.set(COW, cow);
        self.with_flags(f)
    }

    pub fn perms(self) -> PtePerms {
        let mut p = PtePerms::READ;
        p.set(PtePerms::WRITE, self.is_writable());
        p.set(PtePerms::EXEC, self.is_executable());
        p.set(PtePerms::USER, self.is_user());
        p
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#x} {:?})", self.addr(), self.flags())
    }
}

// ============================================================================
// Trap frame
// ============================================================================

/// Register snapshot built by the interrupt stubs: general registers pushed
/// rax-first (so r15 sits lowest), an error code (0 when the vector has
/// none), then the CPU's iretq frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    pub fn new_user(entry: u64, sp: u64) -> Self {
        Self {
            rip: entry,
            cs: USER_CS,
            rflags: RFLAGS_IF | 0x2,
            rsp: sp,
            ss: USER_DS,
            ..Self::default()
        }
    }

    pub fn pc(&self) -> u64 {
        self.rip
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.rip = pc;
    }

    pub fn sp(&self) -> u64 {
        self.rsp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.rsp = sp;
    }

    pub fn syscall_number(&self) -> u64 {
        self.rax
    }

    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    pub fn return_value(&self) -> i64 {
        self.rax as i64
    }

    /// Load a system-call request, as user code would before `int 0x80`.
    pub fn set_syscall(&mut self, nr: u64, args: [u64; 6]) {
        self.rax = nr;
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9] = args;
    }

    pub fn set_return(&mut self, value: i64) {
        self.rax = value as u64;
    }

    /// Back up over the trapping instruction so it executes again.
    pub fn restart_syscall(&mut self) {
        self.rip -= SYSCALL_INSN_LEN;
    }

    /// Redirect the frame into `handler(args[0], args[1], args[2])` with
    /// stack pointer `sp`.  The return address must already be at `[sp]`.
    pub fn enter_handler(&mut self, handler: u64, args: [u64; 3], sp: u64, _ret: u64) {
        self.rip = handler;
        self.rdi = args[0];
        self.rsi = args[1];
        self.rdx = args[2];
        self.rsp = sp;
    }

    /// Force a frame read back from user memory to user privilege.
    pub fn sanitize_user(&mut self) {
        self.cs = USER_CS;
        self.ss = USER_DS;
        self.rflags = (self.rflags | RFLAGS_IF) & !RFLAGS_IOPL;
    }

    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

// ============================================================================
// Switch context
// ============================================================================

/// Callee-saved state across `switch_context` (System V ABI).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
}

impl Context {
    /// A context that starts executing `entry` on stack `sp`.
    pub fn new_task(entry: u64, sp: u64) -> Self {
        Self { rsp: sp, rip: entry, ..Self::default() }
    }

    pub fn sp(&self) -> u64 {
        self.rsp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.rsp = sp;
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub mod cpu {
    use x86_64::instructions::{interrupts, tlb};
    use x86_64::registers::control::{Cr2, Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::{PhysAddr, VirtAddr};

    use super::Context;

    pub fn flush_tlb_page(va: u64) {
        tlb::flush(VirtAddr::new_truncate(va));
    }

    pub fn flush_tlb_all() {
        tlb::flush_all();
    }

    pub fn activate_root(root_phys: u64) {
        let frame = PhysFrame::containing_address(PhysAddr::new(root_phys));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    pub fn irq_save() -> usize {
        let enabled = interrupts::are_enabled();
        interrupts::disable();
        enabled as usize
    }

    pub fn irq_restore(saved: usize) {
        if saved != 0 {
            interrupts::enable();
        }
    }

    pub fn halt() {
        x86_64::instructions::hlt();
    }

    pub fn fault_address() -> u64 {
        Cr2::read_raw()
    }

    /// Save callee-saved registers into `old` and resume `new`.
    ///
    /// # Safety
    /// Both pointers must be valid; `new` must describe a live stack.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
        core::arch::naked_asm!(
            "mov [rdi + 0x00], r15",
            "mov [rdi + 0x08], r14",
            "mov [rdi + 0x10], r13",
            "mov [rdi + 0x18], r12",
            "mov [rdi + 0x20], rbx",
            "mov [rdi + 0x28], rbp",
            // resume point: our return address, with it popped
            "lea rax, [rsp + 8]",
            "mov [rdi + 0x30], rax",
            "mov rax, [rsp]",
            "mov [rdi + 0x38], rax",
            "mov r15, [rsi + 0x00]",
            "mov r14, [rsi + 0x08]",
            "mov r13, [rsi + 0x10]",
            "mov r12, [rsi + 0x18]",
            "mov rbx, [rsi + 0x20]",
            "mov rbp, [rsi + 0x28]",
            "mov rsp, [rsi + 0x30]",
            "jmp qword ptr [rsi + 0x38]",
        );
    }
}
