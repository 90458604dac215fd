//! EL1 physical generic timer: the periodic tick source on this port.
//!
//! The comparator must be re-armed from the tick handler - the generic
//! timer has no auto-reload mode.

/// Ticks of the system counter per interrupt, derived from the counter
/// frequency at init time and cached for re-arming.
static mut TICK_INTERVAL: u64 = 0;

/// Program the first deadline `hz` interrupts per second out and enable
/// the timer. The interrupt line itself is opened at the GIC separately.
pub fn start_periodic(hz: u32) {
    #[cfg(target_os = "none")]
    unsafe {
        let freq: u64;
        core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack, preserves_flags));
        let interval = freq / u64::from(hz.max(1));
        *(&raw mut TICK_INTERVAL) = interval;
        core::arch::asm!(
            "msr cntp_tval_el0, {interval}",
            "msr cntp_ctl_el0, {enable}",
            interval = in(reg) interval,
            enable = in(reg) 1u64,
            options(nomem, nostack, preserves_flags),
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = hz;
}

/// Set the next deadline. Called from the tick handler before it returns.
pub fn rearm() {
    #[cfg(target_os = "none")]
    unsafe {
        let interval = *(&raw const TICK_INTERVAL);
        core::arch::asm!(
            "msr cntp_tval_el0, {}",
            in(reg) interval,
            options(nomem, nostack, preserves_flags),
        );
    }
}
