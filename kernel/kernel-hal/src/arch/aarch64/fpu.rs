//! FPU state hooks.
//!
//! The FP/SIMD unit is always enabled on this port and no task-visible
//! state is lazily managed yet, so save and restore are deliberate
//! no-ops. The buffer and both call sites exist so a port with real
//! extended state plugs in without touching callers.

use crate::context::FpuArea;

/// Snapshot the floating-point/vector register file into `area`.
#[inline]
pub fn save_fpu(area: &mut FpuArea) {
    let _ = area;
}

/// Load the floating-point/vector register file from `area`.
#[inline]
pub fn restore_fpu(area: &FpuArea) {
    let _ = area;
}
