//! # aarch64
//!
//! The memory-mapped architecture: exception-level descent at boot,
//! statically built block identity map, PL011 serial behind the port-I/O
//! compatibility shim, VBAR-based exception vectors, and `eret`-based
//! privilege transitions. The FPU hooks are no-ops - the unit is always
//! enabled here - but the call sites upstream stay, so a port that needs
//! real save/restore plugs in without touching callers.

pub mod boot;
mod fpu;
pub mod gic;
pub mod timer;
mod trap_frame;
pub mod uart;
mod usermode;
#[cfg(target_os = "none")]
pub mod vectors;

pub use fpu::{restore_fpu, save_fpu};
pub use trap_frame::TrapFrame;
pub use usermode::enter_user_mode;

use kernel_addresses::PhysicalAddress;

/// Load a new address-space root (TTBR0_EL1) and flush cached
/// translations for the outgoing space.
///
/// # Safety
/// The root must map all kernel code, data and the current stack.
#[inline]
pub unsafe fn load_address_space_root(root: PhysicalAddress) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {}",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            in(reg) root.as_u64(),
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}
