// kernel/src/interrupts/pic.rs
//
// Legacy 8259 pair, remapped above the CPU exception vectors.  Only the
// timer line is unmasked.

use x86_64::instructions::port::Port;

const CMD_INIT: u8 = 0x11;
const CMD_END_OF_INTERRUPT: u8 = 0x20;
const MODE_8086: u8 = 0x01;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

pub const PIC1_OFFSET: u8 = 32;
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Irq {
    Timer = 0,
}

impl Irq {
    pub fn vector(self) -> u8 {
        PIC1_OFFSET + self as u8
    }
}

fn outb(port: u16, value: u8) {
    unsafe { Port::<u8>::new(port).write(value) };
}

fn inb(port: u16) -> u8 {
    unsafe { Port::<u8>::new(port).read() }
}

/// Remap both controllers and mask every line.
pub fn initialize() {
    outb(PIC1_COMMAND, CMD_INIT);
    outb(PIC2_COMMAND, CMD_INIT);
    outb(PIC1_DATA, PIC1_OFFSET);
    outb(PIC2_DATA, PIC2_OFFSET);
    // Slave on IRQ2, cascade identity 2.
    outb(PIC1_DATA, 4);
    outb(PIC2_DATA, 2);
    outb(PIC1_DATA, MODE_8086);
    outb(PIC2_DATA, MODE_8086);

    outb(PIC1_DATA, 0xff);
    outb(PIC2_DATA, 0xff);
}

pub fn enable(irq: Irq) {
    let mask = inb(PIC1_DATA);
    outb(PIC1_DATA, mask & !(1 << irq as u8));
}

pub fn end_of_interrupt(irq: Irq) {
    if irq.vector() >= PIC2_OFFSET {
        outb(PIC2_COMMAND, CMD_END_OF_INTERRUPT);
    }
    outb(PIC1_COMMAND, CMD_END_OF_INTERRUPT);
}
