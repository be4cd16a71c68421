// kernel/src/interrupts/entry.rs
//
// Assembly trap stubs.
//
// A stub pushes a zero error code when the CPU does not supply one, saves
// rax and loads its vector number into eax, then joins `trap_common`,
// which pushes the remaining registers (rax first, so r15 sits lowest) and
// calls `trap_dispatch(frame, vector)`.  The exit path pops the frame back
// and `iretq`s.
//
// The CPU aligns rsp to 16 before pushing its frame; with the error code
// and 15 registers on top the stack is 8 bytes off, hence the `sub rsp, 8`
// around each call.

use core::arch::global_asm;

global_asm!(
    ".global trap_common",
    "trap_common:",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "mov esi, eax",
    "sub rsp, 8",
    "cld",
    "call trap_dispatch",
    "add rsp, 8",
    ".global trap_return",
    "trap_return:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "add rsp, 8",
    "iretq",
    "",
    // First instructions of every task: rsp is the task's trap frame slot.
    ".global task_entry",
    "task_entry:",
    "mov rdi, rsp",
    "sub rsp, 8",
    "call task_start",
    "add rsp, 8",
    "jmp trap_return",
    "",
    ".global vector_divide_error",
    "vector_divide_error:",
    "push 0",
    "push rax",
    "mov eax, 0",
    "jmp trap_common",
    "",
    ".global vector_invalid_opcode",
    "vector_invalid_opcode:",
    "push 0",
    "push rax",
    "mov eax, 6",
    "jmp trap_common",
    "",
    ".global vector_double_fault",
    "vector_double_fault:",
    "push rax",
    "mov eax, 8",
    "jmp trap_common",
    "",
    ".global vector_general_protection",
    "vector_general_protection:",
    "push rax",
    "mov eax, 13",
    "jmp trap_common",
    "",
    ".global vector_page_fault",
    "vector_page_fault:",
    "push rax",
    "mov eax, 14",
    "jmp trap_common",
    "",
    ".global vector_timer",
    "vector_timer:",
    "push 0",
    "push rax",
    "mov eax, 32",
    "jmp trap_common",
    "",
    ".global vector_syscall",
    "vector_syscall:",
    "push 0",
    "push rax",
    "mov eax, 0x80",
    "jmp trap_common",
);

extern "C" {
    pub fn trap_return();
    pub fn task_entry();
    pub fn vector_divide_error();
    pub fn vector_invalid_opcode();
    pub fn vector_double_fault();
    pub fn vector_general_protection();
    pub fn vector_page_fault();
    pub fn vector_timer();
    pub fn vector_syscall();
}
