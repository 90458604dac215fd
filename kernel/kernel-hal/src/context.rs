//! # Task Context & Switching
//!
//! The mechanical half of multitasking: saving and restoring register
//! state across a switch and tracking which address-space root is live.
//! *Which* task runs next is the external scheduler's decision; it calls
//! [`Cpu::switch_to`] from trap context and resumes whatever frame comes
//! back.

use crate::arch;
use crate::arch::TrapFrame;
use kernel_addresses::{PhysicalAddress, VirtualAddress};

/// Buffer for the floating-point/vector register file.
///
/// Size and alignment are fixed by the largest extended-state format in
/// play (`fxsave64` writes 512 bytes at 16-byte alignment). Architectures
/// whose save/restore is a no-op keep the buffer anyway so the call sites
/// never change.
#[repr(C, align(16))]
pub struct FpuArea([u8; 512]);

impl Default for FpuArea {
    fn default() -> Self {
        Self::new()
    }
}

impl FpuArea {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; 512])
    }

    pub(crate) const fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }

    pub(crate) const fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }
}

/// The HAL-owned slice of a task: saved registers, extended state, and the
/// address-space root to activate when the task runs. The scheduler
/// embeds one of these per task and owns everything else about it.
pub struct TaskContext {
    frame: TrapFrame,
    fpu: FpuArea,
    root: PhysicalAddress,
}

impl TaskContext {
    #[must_use]
    pub const fn new(frame: TrapFrame, root: PhysicalAddress) -> Self {
        Self {
            frame,
            fpu: FpuArea::new(),
            root,
        }
    }

    #[must_use]
    pub const fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub const fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }
}

/// Per-core switching state: the root that is actually loaded right now.
///
/// Tracking it here lets a switch between tasks sharing one address space
/// skip the translation-cache flush entirely.
pub struct Cpu {
    active_root: PhysicalAddress,
}

impl Cpu {
    /// `boot_root` is the address space active when the core reaches the
    /// scheduler for the first time.
    #[must_use]
    pub const fn new(boot_root: PhysicalAddress) -> Self {
        Self {
            active_root: boot_root,
        }
    }

    #[must_use]
    pub const fn active_root(&self) -> PhysicalAddress {
        self.active_root
    }

    /// Swap `old` out and `new` in.
    ///
    /// Called from trap context with `frame` pointing at the interrupted
    /// task's live register frame. Saves the frame and extended state into
    /// `old`, restores `new`'s extended state, activates `new`'s address
    /// space if it differs from the live one, and returns the frame the
    /// trap return path must resume instead.
    pub fn switch_to(
        &mut self,
        old: &mut TaskContext,
        new: &mut TaskContext,
        frame: &TrapFrame,
    ) -> *const TrapFrame {
        old.frame = *frame;
        arch::save_fpu(&mut old.fpu);
        arch::restore_fpu(&new.fpu);

        if new.root != self.active_root {
            self.active_root = new.root;
            // SAFETY: the scheduler hands us tasks whose roots map the
            // kernel half; switching roots mid-trap is therefore safe.
            unsafe { arch::load_address_space_root(new.root) };
        }
        &new.frame
    }

    /// One-way transition from kernel initialization into the first task's
    /// user-mode instruction stream.
    ///
    /// Builds the privileged-return frame by hand so the trap-return
    /// instruction drops to user privilege instead of returning here.
    ///
    /// # Safety
    /// `entry` and `stack` must be mapped user-accessible in the active
    /// address space; interrupts and the trap path must be fully set up,
    /// because the very next trap will find user state.
    pub unsafe fn go_userspace(entry: VirtualAddress, stack: VirtualAddress) -> ! {
        unsafe { arch::enter_user_mode(entry, stack) }
    }
}
