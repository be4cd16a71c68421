// kernel/src/interrupts/idt.rs
//
// Interrupt Descriptor Table.  Every vector points at an assembly stub
// (see `entry`), so entries only ever carry a raw handler address.

use core::mem::size_of;

use lumen::arch::x86::KERNEL_CS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct IdtEntryOptions(u16);

impl IdtEntryOptions {
    const PRESENT: u16 = 1 << 15;
    const INTERRUPT_GATE: u16 = 0xE << 8;

    /// Interrupt gates clear IF on entry; the kernel runs with interrupts
    /// off until it returns to user mode or idles.
    pub const fn interrupt_gate() -> Self {
        IdtEntryOptions(Self::PRESENT | Self::INTERRUPT_GATE)
    }
}

/// 16-byte gate descriptor:
///   bytes 0-1 offset low, 2-3 selector, 4 IST (bits 0:2),
///   5 type/DPL/P, 6-7 offset middle, 8-11 offset high, 12-15 reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct IdtEntry {
    pointer_low: u16,
    gdt_selector: u16,
    options: IdtEntryOptions,
    pointer_middle: u16,
    pointer_high: u32,
    reserved: u32,
}

impl IdtEntry {
    pub const fn missing() -> Self {
        IdtEntry {
            pointer_low: 0,
            gdt_selector: 0,
            options: IdtEntryOptions(0),
            pointer_middle: 0,
            pointer_high: 0,
            reserved: 0,
        }
    }

    pub fn set_handler_addr(&mut self, addr: u64) -> &mut Self {
        self.pointer_low = addr as u16;
        self.pointer_middle = (addr >> 16) as u16;
        self.pointer_high = (addr >> 32) as u32;
        self.gdt_selector = KERNEL_CS as u16;
        self.options = IdtEntryOptions::interrupt_gate();
        self
    }

    /// Lowest ring allowed to raise the vector with `int n`.
    pub fn set_privilege_level(&mut self, dpl: u16) -> &mut Self {
        let opts = self.options.0;
        self.options = IdtEntryOptions((opts & !0x6000) | ((dpl & 0b11) << 13));
        self
    }

    /// Switch to TSS interrupt stack `index` (1..=7) before the handler runs.
    pub fn set_ist_index(&mut self, index: u16) -> &mut Self {
        debug_assert!(index <= 7, "IST index must be 0-7, got {}", index);
        let opts = self.options.0;
        self.options = IdtEntryOptions((opts & !0x07) | (index & 0x07));
        self
    }
}

#[repr(C)]
pub struct InterruptDescriptorTable {
    pub entries: [IdtEntry; 256],
}

impl InterruptDescriptorTable {
    pub const fn new() -> Self {
        InterruptDescriptorTable { entries: [IdtEntry::missing(); 256] }
    }

    pub fn set(&mut self, vector: u8, stub: unsafe extern "C" fn()) -> &mut IdtEntry {
        let entry = &mut self.entries[vector as usize];
        entry.set_handler_addr(stub as usize as u64);
        entry
    }

    pub fn load(&'static self) {
        let descriptor = IdtDescriptor {
            size: (size_of::<Self>() - 1) as u16,
            address: self as *const _ as u64,
        };
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &descriptor, options(readonly, nostack, preserves_flags));
        }
    }
}

#[repr(C, packed(2))]
struct IdtDescriptor {
    size: u16,
    address: u64,
}
