//! Exception vector table and the glue that maps hardware exception
//! classes onto the portable vector numbering.
//!
//! Each of the 16 table slots is 128 bytes - too small for a full
//! register save - so the slots hold a single branch to one of four
//! out-of-line stubs (sync, IRQ, FIQ, SError). The stubs build a
//! [`TrapFrame`] on the kernel stack, call into Rust, restore, and
//! `eret` whatever the frame then says.

use super::gic::{GICC_BASE, GICD_BASE, Gic, SPURIOUS, TIMER_PPI};
use super::trap_frame::TrapFrame;
use crate::trap::{self, vector};

core::arch::global_asm!(
    ".section .text.vectors, \"ax\"",
    // One out-of-line trap stub per exception kind.
    ".macro TRAP_STUB name, kind",
    "\\name:",
    "sub sp, sp, #272",
    "stp x0, x1, [sp, #0]",
    "stp x2, x3, [sp, #16]",
    "stp x4, x5, [sp, #32]",
    "stp x6, x7, [sp, #48]",
    "stp x8, x9, [sp, #64]",
    "stp x10, x11, [sp, #80]",
    "stp x12, x13, [sp, #96]",
    "stp x14, x15, [sp, #112]",
    "stp x16, x17, [sp, #128]",
    "stp x18, x19, [sp, #144]",
    "stp x20, x21, [sp, #160]",
    "stp x22, x23, [sp, #176]",
    "stp x24, x25, [sp, #192]",
    "stp x26, x27, [sp, #208]",
    "stp x28, x29, [sp, #224]",
    "str x30, [sp, #240]",
    "mrs x0, sp_el0",
    "str x0, [sp, #248]",
    "mrs x0, elr_el1",
    "str x0, [sp, #256]",
    "mrs x0, spsr_el1",
    "str x0, [sp, #264]",
    "mov x0, sp",
    "mov x1, #\\kind",
    "bl aarch64_trap",
    "ldr x0, [sp, #248]",
    "msr sp_el0, x0",
    "ldr x0, [sp, #256]",
    "msr elr_el1, x0",
    "ldr x0, [sp, #264]",
    "msr spsr_el1, x0",
    "ldp x0, x1, [sp, #0]",
    "ldp x2, x3, [sp, #16]",
    "ldp x4, x5, [sp, #32]",
    "ldp x6, x7, [sp, #48]",
    "ldp x8, x9, [sp, #64]",
    "ldp x10, x11, [sp, #80]",
    "ldp x12, x13, [sp, #96]",
    "ldp x14, x15, [sp, #112]",
    "ldp x16, x17, [sp, #128]",
    "ldp x18, x19, [sp, #144]",
    "ldp x20, x21, [sp, #160]",
    "ldp x22, x23, [sp, #176]",
    "ldp x24, x25, [sp, #192]",
    "ldp x26, x27, [sp, #208]",
    "ldp x28, x29, [sp, #224]",
    "ldr x30, [sp, #240]",
    "add sp, sp, #272",
    "eret",
    ".endm",
    "TRAP_STUB trap_sync, 0",
    "TRAP_STUB trap_irq, 1",
    "TRAP_STUB trap_fiq, 2",
    "TRAP_STUB trap_serror, 3",
    // The table itself: 16 slots of 128 bytes, 2 KiB aligned. Every
    // configuration row routes to the same four stubs so nothing is
    // silently dropped, including the unsupported aarch32 row.
    ".macro VECTOR_ROW",
    ".align 7",
    "b trap_sync",
    ".align 7",
    "b trap_irq",
    ".align 7",
    "b trap_fiq",
    ".align 7",
    "b trap_serror",
    ".endm",
    ".align 11",
    ".global exception_vector_table",
    "exception_vector_table:",
    "VECTOR_ROW", // current EL, SP_EL0
    "VECTOR_ROW", // current EL, SP_ELx (kernel-mode traps)
    "VECTOR_ROW", // lower EL, aarch64 (user-mode traps)
    "VECTOR_ROW", // lower EL, aarch32
);

/// Exception kinds encoded by the stubs.
const KIND_SYNC: u64 = 0;
const KIND_IRQ: u64 = 1;

/// Point VBAR_EL1 at the vector table.
///
/// # Safety
/// Call once during init, before interrupts are unmasked.
pub unsafe fn install_vector_table() {
    unsafe extern "C" {
        static exception_vector_table: u8;
    }
    let addr = core::ptr::addr_of!(exception_vector_table) as u64;
    unsafe {
        core::arch::asm!("msr vbar_el1, {}", "isb", in(reg) addr, options(nostack, preserves_flags));
    }
}

/// Map a synchronous exception class (ESR_EL1.EC) onto the portable
/// vector space.
fn sync_vector(esr: u64) -> u8 {
    let ec = (esr >> 26) & 0x3F;
    match ec {
        // SVC from aarch64: the syscall trap. ELR already points past
        // the instruction, so nothing needs advancing.
        0x15 => vector::SYSCALL,
        // Instruction or data aborts, either EL: the page-fault vector.
        0x20 | 0x21 | 0x24 | 0x25 => vector::PAGE_FAULT,
        // FP/SIMD access trap.
        0x07 => vector::DEVICE_NOT_AVAILABLE,
        // Unknown/unallocated encodings.
        0x00 => vector::INVALID_OPCODE,
        _ => vector::GENERAL_PROTECTION,
    }
}

/// Rust landing point for every exception. `kind` says which stub fired.
#[unsafe(no_mangle)]
extern "C" fn aarch64_trap(frame: &mut TrapFrame, kind: u64) {
    match kind {
        KIND_SYNC => {
            let esr: u64;
            unsafe {
                core::arch::asm!("mrs {}, esr_el1", out(reg) esr, options(nomem, nostack, preserves_flags));
            }
            trap::dispatch_installed(sync_vector(esr), frame);
        }
        KIND_IRQ => {
            // SAFETY: the register blocks are device-mapped by boot.
            let gic = unsafe { Gic::new(GICD_BASE, GICC_BASE) };
            let intid = gic.acknowledge();
            if intid == SPURIOUS {
                return;
            }
            let vec = if intid == TIMER_PPI {
                vector::TIMER
            } else {
                // No other line is enabled; anything else folds into the
                // device range and gets the drop-and-complete treatment.
                vector::DEVICE_IRQ_BASE + (intid % 16) as u8
            };
            trap::dispatch_installed(vec, frame);
            gic.end_of_interrupt(intid);
        }
        // FIQ and SError: nothing at this layer can recover either.
        _ => crate::halt_forever(),
    }
}
