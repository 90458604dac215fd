//! # x86_64
//!
//! The fully implemented architecture: legacy-boot mode transition, GDT
//! and IDT, 8259 PIC + PIT timer, native port I/O, `fxsave`-based FPU
//! state, and `iretq`-based privilege transitions.

pub mod boot;
mod fpu;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;
mod ports;
mod trap_frame;
#[cfg(target_os = "none")]
pub mod trap_entry;
mod usermode;

pub use fpu::{restore_fpu, save_fpu};
pub use ports::{NativePorts, inb, inl, inw, outb, outl, outw};
pub use trap_frame::TrapFrame;
pub use usermode::enter_user_mode;

use kernel_addresses::PhysicalAddress;

/// Load a new address-space root (CR3), flushing all non-global cached
/// translations as a side effect.
///
/// # Safety
/// The root must map all kernel code, data and the current stack.
#[inline]
pub unsafe fn load_address_space_root(root: PhysicalAddress) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!(
            "mov cr3, {}",
            in(reg) root.as_u64(),
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}
