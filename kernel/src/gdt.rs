// kernel/src/gdt.rs
//
// GDT and TSS.  The selector order (null, kernel code, kernel data, user
// data, user code, TSS) is what the trap frames built by the library
// assume.  RSP0 is rewritten on every switch so traps from user mode land
// on the incoming task's kernel stack.

use core::ptr::{addr_of, addr_of_mut};

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use lumen::arch::x86::{KERNEL_CS, USER_CS, USER_DS};

/// IDT stack index for double faults (1-based, as the IDT encodes it).
pub const DOUBLE_FAULT_IST: u16 = 1;

const STACK_SIZE: usize = 4096 * 5;

static mut DOUBLE_FAULT_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];
/// RSP0 until the first task runs.
static mut BOOT_TRAP_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

static mut TSS: TaskStateSegment = TaskStateSegment::new();

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.append(Descriptor::kernel_code_segment());
        let data = gdt.append(Descriptor::kernel_data_segment());
        let udata = gdt.append(Descriptor::user_data_segment());
        let ucode = gdt.append(Descriptor::user_code_segment());
        let tss = gdt.append(Descriptor::tss_segment(unsafe { &*addr_of!(TSS) }));
        assert_eq!(code.0 as u64, KERNEL_CS);
        assert_eq!(udata.0 as u64, USER_DS);
        assert_eq!(ucode.0 as u64, USER_CS);
        (gdt, Selectors { code, data, tss })
    };
}

pub fn init() {
    unsafe {
        let tss = &mut *addr_of_mut!(TSS);
        tss.interrupt_stack_table[(DOUBLE_FAULT_IST - 1) as usize] =
            VirtAddr::from_ptr(addr_of!(DOUBLE_FAULT_STACK)) + STACK_SIZE as u64;
        tss.privilege_stack_table[0] = VirtAddr::from_ptr(addr_of!(BOOT_TRAP_STACK)) + STACK_SIZE as u64;
    }

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.code);
        DS::set_reg(GDT.1.data);
        ES::set_reg(GDT.1.data);
        SS::set_reg(GDT.1.data);
        load_tss(GDT.1.tss);
    }
    lumen::serial_println!("gdt: loaded, tss at {:p}", addr_of!(TSS));
}

/// Stack the CPU switches to on the next trap from user mode.
///
/// Interrupts must be off: the TSS is read by the CPU at trap time.
pub fn set_kernel_stack(top: u64) {
    unsafe {
        (*addr_of_mut!(TSS)).privilege_stack_table[0] = VirtAddr::new(top);
    }
}
