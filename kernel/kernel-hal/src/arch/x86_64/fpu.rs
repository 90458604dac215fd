//! FPU/SSE state save and restore via `fxsave64`/`fxrstor64`.
//!
//! Called around every context switch. The 512-byte, 16-byte-aligned
//! buffer layout is the FXSAVE area defined by the architecture.

use crate::context::FpuArea;

/// Snapshot the floating-point/vector register file into `area`.
#[inline]
pub fn save_fpu(area: &mut FpuArea) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!(
            "fxsave64 [{}]",
            in(reg) area.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = area;
}

/// Load the floating-point/vector register file from `area`.
#[inline]
pub fn restore_fpu(area: &FpuArea) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!(
            "fxrstor64 [{}]",
            in(reg) area.as_ptr(),
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = area;
}
