//! The register frame the trap entry stubs build on the kernel stack.

use crate::arch::gdt;
use kernel_addresses::VirtualAddress;

/// Saved machine state at the moment of a trap.
///
/// Field order is the **memory layout** the entry stubs produce: fifteen
/// general-purpose registers pushed by software (ascending addresses, so
/// `r15` was pushed last), then the vector number and error code, then the
/// five-word frame the CPU itself pushed. Editing a field changes what
/// `iretq` resumes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    /// Vector number, pushed by the entry stub.
    pub vector: u64,
    /// Hardware error code for the vectors that have one, 0 otherwise.
    pub error_code: u64,

    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// `RFLAGS` with the interrupt-enable bit and the always-one bit set.
const RFLAGS_IF: u64 = 0x202;

const _: () = assert!(size_of::<TrapFrame>() == 22 * 8);

impl TrapFrame {
    /// A fresh kernel-mode frame: resuming it begins executing `entry` on
    /// `stack` with interrupts enabled and all GPRs zero.
    #[must_use]
    pub const fn new_kernel(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        Self::new(entry, stack, gdt::KERNEL_CS as u64, gdt::KERNEL_DS as u64)
    }

    /// A fresh user-mode frame: resuming it drops to ring 3 at `entry`.
    #[must_use]
    pub const fn new_user(entry: VirtualAddress, stack: VirtualAddress) -> Self {
        Self::new(entry, stack, gdt::USER_CS as u64, gdt::USER_DS as u64)
    }

    const fn new(entry: VirtualAddress, stack: VirtualAddress, cs: u64, ss: u64) -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: entry.as_u64(),
            cs,
            rflags: RFLAGS_IF,
            rsp: stack.as_u64(),
            ss,
        }
    }

    /// Whether the interrupted code was running in user mode. The
    /// requested privilege level lives in the low two selector bits.
    #[inline]
    #[must_use]
    pub const fn from_user(&self) -> bool {
        self.cs & 0b11 == 0b11
    }

    #[inline]
    #[must_use]
    pub const fn instruction_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.rip)
    }

    #[inline]
    pub const fn set_instruction_pointer(&mut self, ip: VirtualAddress) {
        self.rip = ip.as_u64();
    }

    #[inline]
    #[must_use]
    pub const fn stack_pointer(&self) -> VirtualAddress {
        VirtualAddress::new(self.rsp)
    }
}
