//! # Port I/O Primitive
//!
//! The one I/O contract the rest of the kernel is written against:
//! byte/word/double-word reads and writes addressed by 16-bit port number.
//!
//! On x86_64 this is the hardware's own port space
//! ([`arch::NativePorts`](crate::arch)). Architectures without port
//! instructions get [`CompatPorts`]: a shim that maps the two well-known
//! serial-console ports onto an actual memory-mapped UART and turns every
//! other port into a harmless no-op. Higher layers - the console driver in
//! particular - are written once against [`PortIo`] and run unchanged on
//! both.

use core::hint::spin_loop;

/// Logical port of the primary serial console's data register.
pub const COM1_DATA: u16 = 0x3F8;
/// Logical port of the primary serial console's line-status register.
pub const COM1_LINE_STATUS: u16 = 0x3FD;

/// 16450 line-status bit: receive data ready.
pub const LSR_DATA_READY: u8 = 1 << 0;
/// 16450 line-status bit: transmit holding register empty.
pub const LSR_TX_HOLDING_EMPTY: u8 = 1 << 5;
/// 16450 line-status bit: transmitter idle.
pub const LSR_TX_IDLE: u8 = 1 << 6;

/// Byte/word/double-word access to the port address space.
///
/// Each access touches exactly one hardware register and has no side
/// effect beyond it. Blocking behavior is the device's, not the bus's:
/// a serial byte **write** busy-polls until the transmitter has room, a
/// serial byte **read** never blocks (absence of data is reported through
/// the line-status register, not by waiting).
pub trait PortIo {
    fn read8(&mut self, port: u16) -> u8;
    fn write8(&mut self, port: u16, value: u8);
    fn read16(&mut self, port: u16) -> u16;
    fn write16(&mut self, port: u16, value: u16);
    fn read32(&mut self, port: u16) -> u32;
    fn write32(&mut self, port: u16, value: u32);
}

/// A byte-oriented serial transceiver, as seen by the compatibility shim.
///
/// Implemented by the memory-mapped UART on architectures that need the
/// shim, and by test doubles in unit tests.
pub trait SerialDevice {
    /// Whether the transmitter can accept another byte right now.
    fn tx_ready(&self) -> bool;

    /// Hand a byte to the transmitter. Only called when [`tx_ready`]
    /// reported room.
    ///
    /// [`tx_ready`]: Self::tx_ready
    fn send(&mut self, byte: u8);

    /// Take a received byte if one is pending. Never blocks - `None` is
    /// the expected outcome on an idle line.
    fn try_recv(&mut self) -> Option<u8>;
}

/// Port-I/O compatibility shim over a memory-mapped serial device.
///
/// Emulates a 16450-class serial port at the two documented legacy port
/// numbers:
///
/// - [`COM1_DATA`]: writes block until the device accepts the byte; reads
///   pop a pending byte or yield 0.
/// - [`COM1_LINE_STATUS`]: reads always report the transmitter ready (the
///   blocking happens on the data write, so as far as the contract is
///   concerned there is always room) plus the live receive state.
///
/// Every other port reads as 0 and swallows writes, which lets device
/// probes and init sequences written for real port hardware run harmlessly.
pub struct CompatPorts<U> {
    uart: U,
    /// A byte consumed from the device while answering a line-status poll,
    /// held until the data port is read.
    pending_rx: Option<u8>,
}

impl<U: SerialDevice> CompatPorts<U> {
    pub const fn new(uart: U) -> Self {
        Self {
            uart,
            pending_rx: None,
        }
    }

    /// Give the underlying device back (tests use this to inspect it).
    pub fn into_inner(self) -> U {
        self.uart
    }

    fn peek_rx(&mut self) -> bool {
        if self.pending_rx.is_none() {
            self.pending_rx = self.uart.try_recv();
        }
        self.pending_rx.is_some()
    }
}

impl<U: SerialDevice> PortIo for CompatPorts<U> {
    fn read8(&mut self, port: u16) -> u8 {
        match port {
            COM1_DATA => {
                if self.peek_rx() {
                    self.pending_rx.take().unwrap_or(0)
                } else {
                    0
                }
            }
            COM1_LINE_STATUS => {
                let rx = if self.peek_rx() { LSR_DATA_READY } else { 0 };
                LSR_TX_HOLDING_EMPTY | LSR_TX_IDLE | rx
            }
            _ => 0,
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        if port == COM1_DATA {
            while !self.uart.tx_ready() {
                spin_loop();
            }
            self.uart.send(value);
        }
        // Writes to any other port - including the emulated port's own
        // control registers - are ignored.
    }

    fn read16(&mut self, _port: u16) -> u16 {
        0
    }

    fn write16(&mut self, _port: u16, _value: u16) {}

    fn read32(&mut self, _port: u16) -> u32 {
        0
    }

    fn write32(&mut self, _port: u16, _value: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Recording serial double: captures transmitted bytes, feeds queued
    /// receive bytes, and can simulate a briefly busy transmitter.
    struct MockSerial {
        sent: Vec<u8>,
        rx: VecDeque<u8>,
        busy_polls: core::cell::Cell<u32>,
    }

    impl MockSerial {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                rx: VecDeque::new(),
                busy_polls: core::cell::Cell::new(0),
            }
        }
    }

    impl SerialDevice for MockSerial {
        fn tx_ready(&self) -> bool {
            let remaining = self.busy_polls.get();
            if remaining > 0 {
                self.busy_polls.set(remaining - 1);
                return false;
            }
            true
        }

        fn send(&mut self, byte: u8) {
            assert_eq!(self.busy_polls.get(), 0, "send while transmitter busy");
            self.sent.push(byte);
        }

        fn try_recv(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }
    }

    #[test]
    fn data_port_writes_reach_the_device_in_order() {
        let mut ports = CompatPorts::new(MockSerial::new());
        for b in *b"OK\n" {
            ports.write8(COM1_DATA, b);
        }
        assert_eq!(ports.into_inner().sent, b"OK\n");
    }

    #[test]
    fn data_write_polls_until_the_transmitter_has_room() {
        let mut dev = MockSerial::new();
        dev.busy_polls.set(3);
        let mut ports = CompatPorts::new(dev);
        ports.write8(COM1_DATA, b'x');
        assert_eq!(ports.into_inner().sent, b"x");
    }

    #[test]
    fn line_status_always_reports_transmit_ready() {
        let mut ports = CompatPorts::new(MockSerial::new());
        for _ in 0..4 {
            let lsr = ports.read8(COM1_LINE_STATUS);
            assert_ne!(lsr & LSR_TX_HOLDING_EMPTY, 0);
            assert_ne!(lsr & LSR_TX_IDLE, 0);
        }
    }

    #[test]
    fn data_ready_bit_tracks_the_receive_fifo_without_losing_bytes() {
        let mut dev = MockSerial::new();
        dev.rx.extend(*b"hi");
        let mut ports = CompatPorts::new(dev);

        // Polling the status consumes nothing.
        assert_ne!(ports.read8(COM1_LINE_STATUS) & LSR_DATA_READY, 0);
        assert_ne!(ports.read8(COM1_LINE_STATUS) & LSR_DATA_READY, 0);

        assert_eq!(ports.read8(COM1_DATA), b'h');
        assert_eq!(ports.read8(COM1_DATA), b'i');

        // Empty line: no data ready, reads yield zero immediately.
        assert_eq!(ports.read8(COM1_LINE_STATUS) & LSR_DATA_READY, 0);
        assert_eq!(ports.read8(COM1_DATA), 0);
    }

    #[test]
    fn unknown_ports_read_zero_and_ignore_writes() {
        let mut ports = CompatPorts::new(MockSerial::new());
        ports.write8(0x3F9, 0xAA); // interrupt-enable register of a real 16450
        ports.write8(0x80, 0x55);
        assert_eq!(ports.read8(0x3F9), 0);
        assert_eq!(ports.read8(0x80), 0);
        assert_eq!(ports.read16(0x1F0), 0);
        assert_eq!(ports.read32(0xCF8), 0);
        assert!(ports.into_inner().sent.is_empty());
    }
}
