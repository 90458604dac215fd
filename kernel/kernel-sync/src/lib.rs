//! # Kernel synchronization primitives
//!
//! A spin mutex plus an interrupt guard. On a single core there is no
//! parallel mutator; the only unsolicited control transfer is an
//! interrupt. The guard that matters most here is therefore
//! [`IrqGuard`]: structures an interrupt handler may touch are mutated
//! under [`SpinMutex::lock_irq`], which masks interrupts for the
//! critical section.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin;

pub use irq::IrqGuard;
pub use spin::{SpinMutex, SpinMutexGuard};
