// kernel/src/interrupts/mod.rs
//
// Trap entry and exit.
//
// Every vector enters through a stub in `entry`, which completes the CPU's
// iret frame into a full `TrapFrame` on the kernel stack and calls
// `trap_dispatch`.  For traps from user mode the frame is handed to the
// kernel, the trap is handled, any context switches are carried out, and
// the (possibly rewritten) registers of the current task are copied back
// over the frame before the stub pops it.

pub mod entry;
pub mod idt;
pub mod pic;

use lumen::arch::{self, TrapFrame};
use lumen::memory::fault::Access;
use lumen::process::signal::{SIGFPE, SIGILL, SIGSEGV};
use lumen::process::Switch;
use lumen::Kernel;
use spin::Once;

use crate::gdt;
use idt::InterruptDescriptorTable;

pub const DIVIDE_ERROR: u64 = 0;
pub const INVALID_OPCODE: u64 = 6;
pub const DOUBLE_FAULT: u64 = 8;
pub const GENERAL_PROTECTION: u64 = 13;
pub const PAGE_FAULT: u64 = 14;
pub const TIMER: u64 = pic::PIC1_OFFSET as u64;
pub const SYSCALL: u64 = 0x80;

const PF_WRITE: u64 = 1 << 1;
const PF_INSTRUCTION: u64 = 1 << 4;

static IDT: Once<InterruptDescriptorTable> = Once::new();

pub fn init_idt() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        idt.set(DIVIDE_ERROR as u8, entry::vector_divide_error);
        idt.set(INVALID_OPCODE as u8, entry::vector_invalid_opcode);
        idt.set(DOUBLE_FAULT as u8, entry::vector_double_fault).set_ist_index(gdt::DOUBLE_FAULT_IST);
        idt.set(GENERAL_PROTECTION as u8, entry::vector_general_protection);
        idt.set(PAGE_FAULT as u8, entry::vector_page_fault);
        idt.set(TIMER as u8, entry::vector_timer);
        idt.set(SYSCALL as u8, entry::vector_syscall).set_privilege_level(3);
        idt
    });
    idt.load();
}

/// Unmask the timer and start it at the configured rate.
pub fn init_timer(hz: u32) {
    pic::initialize();
    crate::pit::init(hz);
    pic::enable(pic::Irq::Timer);
}

fn kernel() -> &'static Kernel {
    crate::init::kernel()
}

#[no_mangle]
extern "C" fn trap_dispatch(frame: *mut TrapFrame, vector: u64) {
    let frame = unsafe { &mut *frame };
    let kernel = kernel();

    if !frame.from_user() {
        match vector {
            // Only the idle loop runs with interrupts enabled in ring 0.
            TIMER => {
                pic::end_of_interrupt(pic::Irq::Timer);
                kernel.timer_tick();
            }
            _ => kernel_fault(frame, vector),
        }
        return;
    }

    kernel.enter_trap(frame, frame as *const TrapFrame as u64);
    match vector {
        SYSCALL => kernel.syscall(),
        TIMER => {
            pic::end_of_interrupt(pic::Irq::Timer);
            kernel.timer_tick();
        }
        PAGE_FAULT => {
            // Failure has already raised SIGSEGV.
            let _ = kernel.page_fault(arch::fault_address(), fault_access(frame.error_code));
        }
        DIVIDE_ERROR => user_exception(kernel, SIGFPE),
        INVALID_OPCODE => user_exception(kernel, SIGILL),
        GENERAL_PROTECTION => user_exception(kernel, SIGSEGV),
        _ => kernel_fault(frame, vector),
    }
    return_to_user(kernel, frame);
}

/// Called on a new task's kernel stack by `entry::task_entry`, with the
/// slot its first user frame goes into.
#[no_mangle]
extern "C" fn task_start(frame: *mut TrapFrame) {
    return_to_user(kernel(), unsafe { &mut *frame });
}

fn return_to_user(kernel: &Kernel, frame: &mut TrapFrame) {
    while let Some(switch) = kernel.finish_trap() {
        switch_to(switch);
    }
    match kernel.current_frame() {
        Some(tf) => *frame = tf,
        None => panic!("trap exit with no current task"),
    }
}

pub fn switch_to(switch: Switch) {
    if switch.kernel_stack_top != 0 {
        gdt::set_kernel_stack(switch.kernel_stack_top);
    }
    unsafe { arch::switch_context(switch.old, switch.new) };
}

/// The boot thread after init is started: run whatever is ready, halt
/// when nothing is.
pub fn idle_loop(kernel: &Kernel) -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        while let Some(switch) = kernel.finish_trap() {
            switch_to(switch);
        }
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

fn fault_access(error_code: u64) -> Access {
    if error_code & PF_INSTRUCTION != 0 {
        Access::Execute
    } else if error_code & PF_WRITE != 0 {
        Access::Write
    } else {
        Access::Read
    }
}

fn user_exception(kernel: &Kernel, sig: u32) {
    let mut sched = kernel.scheduler().lock();
    if let Some(pid) = sched.current_pid() {
        lumen::serial_println!("trap: pid {} raised exception, sending signal {}", pid, sig);
        lumen::kernel::force_signal(&mut sched, pid, sig);
    }
}

fn kernel_fault(frame: &TrapFrame, vector: u64) -> ! {
    if vector == PAGE_FAULT {
        lumen::serial_println_raw!("kernel page fault at {:#x}", arch::fault_address());
    }
    panic!("unhandled exception {} (error {:#x}) at {:#x}\n{:#x?}", vector, frame.error_code, frame.rip, frame);
}
