//! # Trap Dispatch
//!
//! One table, one entry per exception/interrupt vector. The architecture
//! glue funnels every trap - CPU exception, device IRQ, syscall - into
//! [`VectorTable::dispatch`] with a uniform vector number and a saved
//! register frame; policy lives here, hardware mechanics stay in `arch`.
//!
//! Policy:
//! - a **registered** vector runs its handler (interrupts stay masked
//!   unless the handler itself re-enables them);
//! - an **unregistered CPU exception** is fatal - the register snapshot is
//!   dumped and the core halts, because continuing with unknown faulted
//!   state risks silent corruption;
//! - an **unregistered device IRQ** is acknowledged at the interrupt
//!   controller and dropped.

use crate::arch::TrapFrame;
use crate::halt_forever;
use log::{debug, error};

/// Vector-number vocabulary shared by both architectures. On x86_64 these
/// are the hardware's own numbers; the aarch64 glue maps exception-class
/// decode onto the same space so portable code registers handlers once.
pub mod vector {
    /// Number of CPU exception vectors; everything below is fatal when
    /// unhandled.
    pub const CPU_EXCEPTION_COUNT: u8 = 32;

    pub const DIVIDE_ERROR: u8 = 0;
    pub const BREAKPOINT: u8 = 3;
    pub const INVALID_OPCODE: u8 = 6;
    pub const DEVICE_NOT_AVAILABLE: u8 = 7;
    pub const DOUBLE_FAULT: u8 = 8;
    pub const GENERAL_PROTECTION: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;

    /// First device IRQ vector (the timer lands here).
    pub const DEVICE_IRQ_BASE: u8 = 32;
    pub const TIMER: u8 = DEVICE_IRQ_BASE;

    /// The syscall trap. Delivered like any other vector; the handler body
    /// belongs to the portable kernel, not to this layer.
    pub const SYSCALL: u8 = 0x80;
}

/// A trap handler: runs in kernel context with interrupts masked, free to
/// rewrite the frame it is given (the trap return path resumes whatever
/// the frame then says).
pub type TrapHandler = fn(&mut TrapFrame);

/// Acknowledge hook called for device IRQ vectors once handling (or
/// dropping) is done - signals end-of-interrupt to the controller.
pub type IrqAck = fn(u8);

/// The vector table: an owned value built during startup and installed
/// once, never mutated afterwards.
pub struct VectorTable {
    handlers: [Option<TrapHandler>; 256],
    irq_ack: Option<IrqAck>,
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handlers: [None; 256],
            irq_ack: None,
        }
    }

    /// Register `handler` for `vector`.
    ///
    /// # Panics
    /// Panics if the vector already has a handler; silently replacing one
    /// would hide a wiring mistake.
    pub fn register(&mut self, vector: u8, handler: TrapHandler) {
        let slot = &mut self.handlers[vector as usize];
        assert!(slot.is_none(), "vector {vector} registered twice");
        *slot = Some(handler);
    }

    /// Install the end-of-interrupt hook for device IRQs.
    pub fn set_irq_ack(&mut self, ack: IrqAck) {
        self.irq_ack = Some(ack);
    }

    /// Deliver one trap.
    pub fn dispatch(&self, vector: u8, frame: &mut TrapFrame) {
        match self.handlers[vector as usize] {
            Some(handler) => {
                handler(frame);
                if is_device_irq(vector) {
                    self.ack(vector);
                }
            }
            None if vector < vector::CPU_EXCEPTION_COUNT => fatal_unhandled(vector, frame),
            None => {
                // Maskable device interrupt nobody asked for: acknowledge
                // so the controller does not jam, then drop it.
                debug!("dropping unhandled IRQ vector {vector}");
                self.ack(vector);
            }
        }
    }

    fn ack(&self, vector: u8) {
        if let Some(ack) = self.irq_ack {
            ack(vector);
        }
    }
}

/// Device IRQs need controller acknowledgment; CPU exceptions and the
/// software syscall trap do not.
const fn is_device_irq(vector: u8) -> bool {
    vector >= vector::DEVICE_IRQ_BASE && vector != vector::SYSCALL
}

/// Unhandled CPU exception: print the diagnostic snapshot (a no-op until
/// a console logger exists) and halt.
fn fatal_unhandled(vector: u8, frame: &TrapFrame) -> ! {
    error!("unhandled CPU exception {vector}");
    error!("{frame:#x?}");
    halt_forever();
}

/// The installed table the architecture trap entries dispatch through.
///
/// Hardware hands traps to bare entry stubs that cannot carry a `&self`,
/// so this is the one place the owned-handle rule bends to a static. It is
/// written exactly once, before interrupts are enabled.
static mut INSTALLED: Option<VectorTable> = None;

/// Install `table` as the live vector table.
///
/// # Safety
/// Must be called once, on the boot core, before interrupts are enabled;
/// nothing synchronizes against a concurrent trap reading the table.
pub unsafe fn install(table: VectorTable) {
    let slot = &raw mut INSTALLED;
    unsafe { *slot = Some(table) };
}

/// Dispatch from an architecture trap entry through the installed table.
///
/// A trap arriving before [`install`] means boot wiring is broken; the
/// core halts (there is nobody else to tell).
pub fn dispatch_installed(vector: u8, frame: &mut TrapFrame) {
    // SAFETY: written once before interrupts were enabled; traps on the
    // single core only read it.
    let table = unsafe { (*(&raw const INSTALLED)).as_ref() };
    match table {
        Some(table) => table.dispatch(vector, frame),
        None => halt_forever(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
    use kernel_addresses::VirtualAddress;

    fn frame() -> TrapFrame {
        TrapFrame::new_kernel(VirtualAddress::new(0x1000), VirtualAddress::new(0x8000))
    }

    fn nop_handler(_f: &mut TrapFrame) {}

    #[test]
    fn registered_handler_runs_and_device_irq_is_acked() {
        static HITS: AtomicU32 = AtomicU32::new(0);
        static ACKED: AtomicU8 = AtomicU8::new(0);
        fn handler(_f: &mut TrapFrame) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }
        fn ack(vector: u8) {
            ACKED.store(vector, Ordering::Relaxed);
        }

        let mut table = VectorTable::new();
        table.register(vector::TIMER, handler);
        table.set_irq_ack(ack);

        table.dispatch(vector::TIMER, &mut frame());
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
        assert_eq!(ACKED.load(Ordering::Relaxed), vector::TIMER);
    }

    #[test]
    fn unregistered_device_irq_is_acked_and_dropped() {
        static ACKED: AtomicU32 = AtomicU32::new(0);
        fn ack(_vector: u8) {
            ACKED.fetch_add(1, Ordering::Relaxed);
        }

        let mut table = VectorTable::new();
        table.set_irq_ack(ack);

        table.dispatch(vector::DEVICE_IRQ_BASE + 5, &mut frame());
        assert_eq!(ACKED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn syscall_vector_is_never_acked_at_the_controller() {
        static HITS: AtomicU32 = AtomicU32::new(0);
        static ACKED: AtomicU32 = AtomicU32::new(0);
        fn handler(_f: &mut TrapFrame) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }
        fn ack(_vector: u8) {
            ACKED.fetch_add(1, Ordering::Relaxed);
        }

        let mut table = VectorTable::new();
        table.register(vector::SYSCALL, handler);
        table.set_irq_ack(ack);

        table.dispatch(vector::SYSCALL, &mut frame());
        assert_eq!(HITS.load(Ordering::Relaxed), 1);
        assert_eq!(ACKED.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "halt_forever")]
    fn unregistered_cpu_exception_is_fatal() {
        let table = VectorTable::new();
        table.dispatch(vector::PAGE_FAULT, &mut frame());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_registration_is_a_programming_error() {
        let mut table = VectorTable::new();
        table.register(vector::BREAKPOINT, nop_handler);
        table.register(vector::BREAKPOINT, nop_handler);
    }

    #[test]
    fn handler_edits_resume_frame() {
        let mut table = VectorTable::new();
        fn bump_ip(f: &mut TrapFrame) {
            let ip = f.instruction_pointer();
            f.set_instruction_pointer(ip + 4);
        }
        table.register(vector::BREAKPOINT, bump_ip);

        let mut f = frame();
        table.dispatch(vector::BREAKPOINT, &mut f);
        assert_eq!(f.instruction_pointer().as_u64(), 0x1004);
    }
}
