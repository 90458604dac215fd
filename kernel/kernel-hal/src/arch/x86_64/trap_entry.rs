//! Naked trap entry stubs.
//!
//! Every vector funnels through one common path that builds a
//! [`TrapFrame`] on the kernel stack, calls the portable dispatcher, and
//! resumes whatever the frame says afterwards - handlers that context
//! switch simply overwrite the frame in place with the next task's saved
//! one before returning.
//!
//! Stack discipline: the CPU aligns the stack and pushes its five-word
//! frame (plus an error code on the vectors that have one). Stubs for
//! error-code-free vectors push a zero so both shapes line up, then every
//! stub pushes its vector number and jumps to the common path. After the
//! fifteen GPR pushes the stack is 16-byte aligned, as the SysV call into
//! Rust requires.

use super::idt::Idt;
use super::trap_frame::TrapFrame;
use crate::trap;

/// Common tail: save GPRs, dispatch, restore, return from the trap.
#[unsafe(naked)]
unsafe extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "cld",
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        // Drop vector number and error code.
        "add rsp, 16",
        "iretq",
        dispatch = sym trap_dispatch_entry,
    )
}

extern "C" fn trap_dispatch_entry(frame: &mut TrapFrame) {
    let vector = (frame.vector & 0xFF) as u8;
    trap::dispatch_installed(vector, frame);
}

/// Stub for a vector the CPU pushes no error code for.
macro_rules! trap_stub {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                concat!("push ", stringify!($vector)),
                "jmp {common}",
                common = sym trap_common,
            )
        }
    };
}

/// Stub for a vector that arrives with a hardware error code on the stack.
macro_rules! trap_stub_with_error_code {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                concat!("push ", stringify!($vector)),
                "jmp {common}",
                common = sym trap_common,
            )
        }
    };
}

trap_stub!(vec0, 0);
trap_stub!(vec1, 1);
trap_stub!(vec2, 2);
trap_stub!(vec3, 3);
trap_stub!(vec4, 4);
trap_stub!(vec5, 5);
trap_stub!(vec6, 6);
trap_stub!(vec7, 7);
trap_stub_with_error_code!(vec8, 8);
trap_stub!(vec9, 9);
trap_stub_with_error_code!(vec10, 10);
trap_stub_with_error_code!(vec11, 11);
trap_stub_with_error_code!(vec12, 12);
trap_stub_with_error_code!(vec13, 13);
trap_stub_with_error_code!(vec14, 14);
trap_stub!(vec15, 15);
trap_stub!(vec16, 16);
trap_stub_with_error_code!(vec17, 17);
trap_stub!(vec18, 18);
trap_stub!(vec19, 19);
trap_stub!(vec20, 20);
trap_stub_with_error_code!(vec21, 21);
trap_stub!(vec22, 22);
trap_stub!(vec23, 23);
trap_stub!(vec24, 24);
trap_stub!(vec25, 25);
trap_stub!(vec26, 26);
trap_stub!(vec27, 27);
trap_stub!(vec28, 28);
trap_stub!(vec29, 29);
trap_stub_with_error_code!(vec30, 30);
trap_stub!(vec31, 31);
trap_stub!(irq32, 32);
trap_stub!(irq33, 33);
trap_stub!(irq34, 34);
trap_stub!(irq35, 35);
trap_stub!(irq36, 36);
trap_stub!(irq37, 37);
trap_stub!(irq38, 38);
trap_stub!(irq39, 39);
trap_stub!(irq40, 40);
trap_stub!(irq41, 41);
trap_stub!(irq42, 42);
trap_stub!(irq43, 43);
trap_stub!(irq44, 44);
trap_stub!(irq45, 45);
trap_stub!(irq46, 46);
trap_stub!(irq47, 47);
trap_stub!(vec128, 128);

/// Exception and IRQ stubs in vector order.
const STUBS: [(u8, unsafe extern "C" fn()); 49] = [
    (0, vec0),
    (1, vec1),
    (2, vec2),
    (3, vec3),
    (4, vec4),
    (5, vec5),
    (6, vec6),
    (7, vec7),
    (8, vec8),
    (9, vec9),
    (10, vec10),
    (11, vec11),
    (12, vec12),
    (13, vec13),
    (14, vec14),
    (15, vec15),
    (16, vec16),
    (17, vec17),
    (18, vec18),
    (19, vec19),
    (20, vec20),
    (21, vec21),
    (22, vec22),
    (23, vec23),
    (24, vec24),
    (25, vec25),
    (26, vec26),
    (27, vec27),
    (28, vec28),
    (29, vec29),
    (30, vec30),
    (31, vec31),
    (32, irq32),
    (33, irq33),
    (34, irq34),
    (35, irq35),
    (36, irq36),
    (37, irq37),
    (38, irq38),
    (39, irq39),
    (40, irq40),
    (41, irq41),
    (42, irq42),
    (43, irq43),
    (44, irq44),
    (45, irq45),
    (46, irq46),
    (47, irq47),
    (128, vec128),
];

/// Point every known vector's gate at its entry stub. The syscall gate is
/// the only one user mode may invoke directly.
pub fn wire_idt(idt: &mut Idt) {
    for (vector, stub) in STUBS {
        let builder = idt[vector as usize]
            .set_handler(stub)
            .present(true)
            .gate_interrupt();
        if vector == trap::vector::SYSCALL {
            builder.dpl(3);
        }
    }
}
