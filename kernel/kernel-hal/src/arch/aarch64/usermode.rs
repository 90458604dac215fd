//! The one-time drop from kernel initialization into EL0.

use kernel_addresses::VirtualAddress;

/// Seed the exception-return registers by hand and `eret`, so the CPU
/// lowers the exception level on the way out.
///
/// # Safety
/// `entry` and `stack` must be mapped user-accessible in the active
/// address space, and the vector table must be live - the next trap
/// arrives from EL0.
#[cfg(target_os = "none")]
pub unsafe fn enter_user_mode(entry: VirtualAddress, stack: VirtualAddress) -> ! {
    unsafe {
        core::arch::asm!(
            "msr sp_el0, {stack}",
            "msr elr_el1, {entry}",
            "msr spsr_el1, xzr", // EL0t, interrupts unmasked
            "eret",
            stack = in(reg) stack.as_u64(),
            entry = in(reg) entry.as_u64(),
            options(noreturn),
        )
    }
}

/// Hosted builds have no EL0 to enter.
#[cfg(not(target_os = "none"))]
pub unsafe fn enter_user_mode(_entry: VirtualAddress, _stack: VirtualAddress) -> ! {
    unreachable!("user-mode entry exists only on bare metal");
}
