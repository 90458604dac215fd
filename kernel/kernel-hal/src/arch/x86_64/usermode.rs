//! The one-time drop from kernel initialization into ring 3.

use kernel_addresses::VirtualAddress;

/// Build an interrupt-return frame by hand and `iretq` through it, so the
/// CPU lowers the privilege level on the way out.
///
/// # Safety
/// `entry` and `stack` must be mapped user-accessible in the active
/// address space, and the trap path (IDT, TSS `rsp0`) must be live;
/// the next trap arrives from ring 3.
#[cfg(target_os = "none")]
pub unsafe fn enter_user_mode(entry: VirtualAddress, stack: VirtualAddress) -> ! {
    use super::gdt::{USER_CS, USER_DS};

    let rip = entry.as_u64();
    let rsp = stack.as_u64();
    let rflags: u64 = 0x202; // IF set: user code runs with interrupts on

    unsafe {
        core::arch::asm!(
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            ss = in(reg) u64::from(USER_DS),
            rsp = in(reg) rsp,
            rflags = in(reg) rflags,
            cs = in(reg) u64::from(USER_CS),
            rip = in(reg) rip,
            options(noreturn),
        )
    }
}

/// Hosted builds have no ring 3 to enter.
#[cfg(not(target_os = "none"))]
pub unsafe fn enter_user_mode(_entry: VirtualAddress, _stack: VirtualAddress) -> ! {
    unreachable!("user-mode entry exists only on bare metal");
}
