// kernel/src/arch/arm64.rs
//
// AArch64 machine layer: ARMv8-A stage-1 descriptors (4 KiB granule,
// 4 levels), the exception frame saved by the EL1 vectors, and the
// callee-saved context (including d8-d15) used for task switches.
//
// Descriptor format:
//
//   63..56  55   54   53   47..12          11  10  9..8  7..6  4..2   1   0
//   [res]  COW  UXN  PXN  [output address]  nG  AF   SH    AP  INDX  T/P   V
//
// COW is one of the software-reserved bits; hardware ignores it.

use super::PtePerms;

pub const SYSCALL_INSN_LEN: u64 = 4;

/// Handlers return through the link register.
pub const RETURN_ADDRESS_ON_STACK: bool = false;

/// `movz x8, #15 ; svc #0 ; brk #0` (rt_sigreturn).
pub const SIGRETURN_TRAMPOLINE: &[u8] = &[
    0xe8, 0x01, 0x80, 0xd2, //
    0x01, 0x00, 0x00, 0xd4, //
    0x00, 0x00, 0x20, 0xd4,
];

const VALID: u64 = 1 << 0;
const TABLE_OR_PAGE: u64 = 1 << 1;
const ATTR_NORMAL: u64 = 0 << 2;
const AP_EL0: u64 = 1 << 6;
const AP_RO: u64 = 1 << 7;
const SH_INNER: u64 = 0b11 << 8;
const AF: u64 = 1 << 10;
const NG: u64 = 1 << 11;
const PXN: u64 = 1 << 53;
const UXN: u64 = 1 << 54;
const COW: u64 = 1 << 55;

const ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

/// SPSR for EL0t with interrupts unmasked.
const SPSR_EL0T: u64 = 0;
const SPSR_MODE_MASK: u64 = 0xf;
const SPSR_DAIF: u64 = 0xf << 6;

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

    pub fn new_table(phys: u64) -> Self {
        Self((phys & ADDR_MASK) | VALID | TABLE_OR_PAGE)
    }

    pub fn new_page(phys: u64, perms: PtePerms) -> Self {
        let mut raw = (phys & ADDR_MASK) | VALID | TABLE_OR_PAGE | ATTR_NORMAL | SH_INNER | AF;
        if !perms.contains(PtePerms::WRITE) {
            raw |= AP_RO;
        }
        if perms.contains(PtePerms::USER) {
            raw |= AP_EL0 | NG | PXN;
            if !perms.contains(PtePerms::EXEC) {
                raw |= UXN;
            }
        } else {
            raw |= UXN;
            if !perms.contains(PtePerms::EXEC) {
                raw |= PXN;
            }
        }
        Self(raw)
    }

    pub fn is_valid(self) -> bool {
        self.0 & VALID != 0
    }

    /// Levels 0-2 only; at level 3 the same bit means "page".
    pub fn is_table(self) -> bool {
        self.is_valid() && self.0 & TABLE_OR_PAGE != 0
    }

    pub fn addr(self) -> u64 {
        self.0 & ADDR_MASK
    }

    pub fn is_writable(self) -> bool {
        self.0 & AP_RO == 0
    }

    pub fn is_user(self) -> bool {
        self.0 & AP_EL0 != 0
    }

    pub fn is_executable(self) -> bool {
        if self.is_user() {
            self.0 & UXN == 0
        } else {
            self.0 & PXN == 0
        }
    }

    pub fn is_cow(self) -> bool {
        self.0 & COW != 0
    }

    pub fn with_writable(self, writable: bool) -> Self {
        if writable {
            Self(self.0 & !AP_RO)
        } else {
            Self(self.0 | AP_RO)
        }
    }

    pub fn with_cow(self, cow: bool) -> Self {
        if cow {
            Self(self.0 | COW)
        } else {
            Self(self.0 & !COW)
        }
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
        write!(f, "Pte({:#x} raw={:#x})", self.addr(), self.0)
    }
}

/// Exception frame saved by the EL1 vector stubs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub x: [u64; 31],
    /// SP_EL0
    pub sp: u64,
    /// ELR_EL1
    pub elr: u64,
    /// SPSR_EL1
    pub spsr: u64,
}

impl TrapFrame {
    pub fn new_user(entry: u64, sp: u64) -> Self {
        Self { elr: entry, sp, spsr: SPSR_EL0T, ..Self::default() }
    }

    pub fn pc(&self) -> u64 {
        self.elr
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.elr = pc;
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.sp = sp;
    }

    pub fn syscall_number(&self) -> u64 {
        self.x[8]
    }

    pub fn syscall_args(&self) -> [u64; 6] {
        [self.x[0], self.x[1], self.x[2], self.x[3], self.x[4], self.x[5]]
    }

    pub fn return_value(&self) -> i64 {
        self.x[0] as i64
    }

    /// Load a system-call request, as user code would before `svc #0`.
    pub fn set_syscall(&mut self, nr: u64, args: [u64; 6]) {
        self.x[8] = nr;
        self.x[..6].copy_from_slice(&args);
    }

    pub fn set_return(&mut self, value: i64) {
        self.x[0] = value as u64;
    }

    pub fn restart_syscall(&mut self) {
        self.elr -= SYSCALL_INSN_LEN;
    }

    pub fn enter_handler(&mut self, handler: u64, args: [u64; 3], sp: u64, ret: u64) {
        self.elr = handler;
        self.x[0] = args[0];
        self.x[1] = args[1];
        self.x[2] = args[2];
        self.x[30] = ret;
        self.sp = sp;
    }

    pub fn sanitize_user(&mut self) {
        self.spsr &= !(SPSR_MODE_MASK | SPSR_DAIF);
    }

    pub fn from_user(&self) -> bool {
        self.spsr & SPSR_MODE_MASK == 0
    }
}

/// Callee-saved registers (AAPCS64) plus the low halves of v8-v15.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// x19..=x28
    pub x: [u64; 10],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    /// d8..=d15
    pub d: [u64; 8],
}

impl Context {
    pub fn new_task(entry: u64, sp: u64) -> Self {
        Self { lr: entry, sp, ..Self::default() }
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn set_sp(&mut self, sp: u64) {
        self.sp = sp;
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub mod cpu {
    use core::arch::asm;

    use super::Context;

    pub fn flush_tlb_page(va: u64) {
        unsafe {
            asm!(
                "dsb ishst",
                "tlbi vaae1is, {}",
                "dsb ish",
                "isb",
                in(reg) (va >> 12) & 0xfff_ffff_ffff,
            );
        }
    }

    pub fn flush_tlb_all() {
        unsafe { asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb") };
    }

    pub fn activate_root(root_phys: u64) {
        unsafe {
            asm!(
                "msr ttbr0_el1, {}",
                "isb",
                "tlbi vmalle1",
                "dsb ish",
                "isb",
                in(reg) root_phys,
            );
        }
    }

    pub fn irq_save() -> usize {
        let daif: u64;
        unsafe { asm!("mrs {}, daif", "msr daifset, #2", out(reg) daif) };
        daif as usize
    }

    pub fn irq_restore(saved: usize) {
        unsafe { asm!("msr daif, {}", in(reg) saved as u64) };
    }

    pub fn halt() {
        unsafe { asm!("wfi") };
    }

    pub fn fault_address() -> u64 {
        let far: u64;
        unsafe { asm!("mrs {}, far_el1", out(reg) far) };
        far
    }

    /// # Safety
    /// Both pointers must be valid; `new` must describe a live stack.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
        core::arch::naked_asm!(
            "stp x19, x20, [x0, #0]",
            "stp x21, x22, [x0, #16]",
            "stp x23, x24, [x0, #32]",
            "stp x25, x26, [x0, #48]",
            "stp x27, x28, [x0, #64]",
            "stp x29, x30, [x0, #80]",
            "mov x9, sp",
            "str x9, [x0, #96]",
            "stp d8, d9, [x0, #104]",
            "stp d10, d11, [x0, #120]",
            "stp d12, d13, [x0, #136]",
            "stp d14, d15, [x0, #152]",
            "ldp x19, x20, [x1, #0]",
            "ldp x21, x22, [x1, #16]",
            "ldp x23, x24, [x1, #32]",
            "ldp x25, x26, [x1, #48]",
            "ldp x27, x28, [x1, #64]",
            "ldp x29, x30, [x1, #80]",
            "ldr x9, [x1, #96]",
            "mov sp, x9",
            "ldp d8, d9, [x1, #104]",
            "ldp d10, d11, [x1, #120]",
            "ldp d12, d13, [x1, #136]",
            "ldp d14, d15, [x1, #152]",
            "ret",
        );
    }
}
