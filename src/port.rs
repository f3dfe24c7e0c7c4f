// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

use crate::error::Result;

// ============================================================================
// Port Trait
// ============================================================================

/// The four primitives the driver needs from the parallel port. Everything
/// else (handshake timing, framing, recovery) is built on top of these.
pub trait Port: Send {
    /// Whether the peripheral currently asserts the handshake line
    fn signal_asserted(&mut self) -> io::Result<bool>;

    fn read_byte(&mut self) -> io::Result<u8>;

    fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    /// Mask (`true`) or unmask host interrupts, returning the previous state
    fn set_interrupt_mask(&mut self, masked: bool) -> io::Result<bool>;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn signal_asserted(&mut self) -> io::Result<bool> {
        (**self).signal_asserted()
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        (**self).read_byte()
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        (**self).write_byte(byte)
    }

    fn set_interrupt_mask(&mut self, masked: bool) -> io::Result<bool> {
        (**self).set_interrupt_mask(masked)
    }
}

// ============================================================================
// Serial Bridge Implementation
// ============================================================================

/// Modem status line that carries the peripheral's handshake signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeLine {
    Cts,
    Dsr,
    CarrierDetect,
    RingIndicator,
}

/// Userport adapter attached through a USB serial bridge. Data bytes travel
/// over the serial stream, the handshake bit is mirrored onto a modem line.
pub struct SerialBridge {
    port: Box<dyn SerialPortTrait>,
    line: HandshakeLine,
    masked: bool,
}

impl SerialBridge {
    pub fn open(port_name: &str, baud_rate: u32, line: HandshakeLine) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(SerialBridge { port, line, masked: false })
    }
}

impl Port for SerialBridge {
    fn signal_asserted(&mut self) -> io::Result<bool> {
        let level = match self.line {
            HandshakeLine::Cts => self.port.read_clear_to_send(),
            HandshakeLine::Dsr => self.port.read_data_set_ready(),
            HandshakeLine::CarrierDetect => self.port.read_carrier_detect(),
            HandshakeLine::RingIndicator => self.port.read_ring_indicator(),
        };
        level.map_err(io::Error::from)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.port.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.port.write_all(&[byte])?;
        self.port.flush()?;
        Ok(())
    }

    // The bridge has no host interrupts to mask; the state is only tracked so
    // the save/restore contract holds.
    fn set_interrupt_mask(&mut self, masked: bool) -> io::Result<bool> {
        Ok(std::mem::replace(&mut self.masked, masked))
    }
}

// ============================================================================
// Mock Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockPort {
    // Bytes handed out by read_byte, in order
    read_buffer: Vec<u8>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    // Handshakes granted before the line goes quiet (None = always asserted)
    handshake_limit: Option<usize>,
    handshakes: usize,
    pub polls: u64,
    pub masked: bool,
    pub mask_log: Vec<bool>,
}

#[cfg(test)]
impl MockPort {
    pub fn new(responses: Vec<u8>, expected_writes: Vec<u8>) -> Self {
        MockPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
            handshake_limit: None,
            handshakes: 0,
            polls: 0,
            masked: false,
            mask_log: Vec::new(),
        }
    }

    /// The line stops asserting after `count` bytes have moved
    pub fn silent_after(mut self, count: usize) -> Self {
        self.handshake_limit = Some(count);
        self
    }
}

#[cfg(test)]
impl Port for MockPort {
    fn signal_asserted(&mut self) -> io::Result<bool> {
        self.polls += 1;
        Ok(self.handshake_limit.is_none_or(|limit| self.handshakes < limit))
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let Some(&byte) = self.read_buffer.get(self.read_pos) else {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Mock out of responses"));
        };
        self.read_pos += 1;
        self.handshakes += 1;
        Ok(byte)
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_log.push(byte);
        self.handshakes += 1;
        Ok(())
    }

    fn set_interrupt_mask(&mut self, masked: bool) -> io::Result<bool> {
        self.mask_log.push(masked);
        Ok(std::mem::replace(&mut self.masked, masked))
    }
}

#[cfg(test)]
impl Drop for MockPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}
