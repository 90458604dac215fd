//! # Legacy 8259 Interrupt Controller
//!
//! The cascaded PIC pair, remapped so device IRQs land on vectors
//! `0x20..0x30` instead of colliding with CPU exceptions. Written against
//! [`PortIo`] like every other port client, which also makes the
//! programming sequence checkable off-target.

use crate::io::PortIo;
use crate::trap::vector::DEVICE_IRQ_BASE;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT_ICW4: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const EOI: u8 = 0x20;

/// The remapped 8259 pair.
pub struct Pic8259<P> {
    ports: P,
}

impl<P: PortIo> Pic8259<P> {
    /// Initialize both chips: remap the primary to
    /// [`DEVICE_IRQ_BASE`] and the secondary right behind it, wire the
    /// cascade, and mask every line. Individual IRQs are opened with
    /// [`enable_irq`](Self::enable_irq) afterwards.
    pub fn init(mut ports: P) -> Self {
        // Start the init sequence (ICW1) on both chips.
        ports.write8(PIC1_CMD, ICW1_INIT_ICW4);
        ports.write8(PIC2_CMD, ICW1_INIT_ICW4);
        // ICW2: vector offsets.
        ports.write8(PIC1_DATA, DEVICE_IRQ_BASE);
        ports.write8(PIC2_DATA, DEVICE_IRQ_BASE + 8);
        // ICW3: secondary chip hangs off line 2 of the primary.
        ports.write8(PIC1_DATA, 1 << 2);
        ports.write8(PIC2_DATA, 2);
        // ICW4: 8086 mode.
        ports.write8(PIC1_DATA, ICW4_8086);
        ports.write8(PIC2_DATA, ICW4_8086);
        // Mask everything until a handler asks for a line.
        ports.write8(PIC1_DATA, 0xFF);
        ports.write8(PIC2_DATA, 0xFF);
        Self { ports }
    }

    /// Unmask one IRQ line (0..16).
    pub fn enable_irq(&mut self, irq: u8) {
        debug_assert!(irq < 16);
        let (port, line) = if irq < 8 {
            (PIC1_DATA, irq)
        } else {
            (PIC2_DATA, irq - 8)
        };
        let mask = self.ports.read8(port) & !(1 << line);
        self.ports.write8(port, mask);
        if irq >= 8 {
            // The cascade line must be open for secondary-chip IRQs.
            let mask = self.ports.read8(PIC1_DATA) & !(1 << 2);
            self.ports.write8(PIC1_DATA, mask);
        }
    }

    /// Signal end-of-interrupt for a delivered vector. Vectors outside the
    /// PIC range are ignored, so the dispatcher can ack unconditionally.
    pub fn end_of_interrupt(&mut self, vector: u8) {
        if !(DEVICE_IRQ_BASE..DEVICE_IRQ_BASE + 16).contains(&vector) {
            return;
        }
        if vector >= DEVICE_IRQ_BASE + 8 {
            self.ports.write8(PIC2_CMD, EOI);
        }
        self.ports.write8(PIC1_CMD, EOI);
    }
}
