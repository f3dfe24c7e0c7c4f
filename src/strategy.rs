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

//! Pluggable byte sources and sinks for the transfer engine.
//!
//! The default strategy walks a linear buffer with the engine's own pointer.
//! A custom strategy takes over addressing completely: the engine stops
//! advancing its pointer while one is installed.

use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};

/// Per-byte read operation used in place of the linear buffer
pub trait SourceOp: Send {
    fn read_one(&mut self, buffer: &[u8]) -> Result<u8>;

    /// Called when the strategy is reset back to the linear buffer
    fn teardown(&mut self) {}
}

/// Per-byte write operation used in place of the linear buffer
pub trait SinkOp: Send {
    fn write_one(&mut self, buffer: &mut [u8], byte: u8) -> Result<()>;

    fn teardown(&mut self) {}
}

fn overrun(pointer: u16, len: usize) -> Error {
    Error::Overrun { pointer, len }
}

// ============================================================================
// Source
// ============================================================================

#[derive(Default)]
pub enum Source {
    /// Next byte of the caller's buffer at the engine pointer
    #[default]
    Linear,
    Custom(Box<dyn SourceOp>),
}

impl Source {
    pub fn custom(op: impl SourceOp + 'static) -> Self {
        Source::Custom(Box::new(op))
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Source::Custom(_))
    }

    pub fn read_one(&mut self, buffer: &[u8], pointer: u16) -> Result<u8> {
        match self {
            Source::Linear => buffer
                .get(usize::from(pointer))
                .copied()
                .ok_or_else(|| overrun(pointer, buffer.len())),
            Source::Custom(op) => op.read_one(buffer),
        }
    }

    pub fn reset(&mut self) {
        if let Source::Custom(op) = self {
            debug!("resetting custom source");
            op.teardown();
        }
        *self = Source::Linear;
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Linear => write!(f, "Linear"),
            Source::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

// ============================================================================
// Sink
// ============================================================================

#[derive(Default)]
pub enum Sink {
    /// Store into the caller's buffer at the engine pointer
    #[default]
    Linear,
    Custom(Box<dyn SinkOp>),
}

impl Sink {
    pub fn custom(op: impl SinkOp + 'static) -> Self {
        Sink::Custom(Box::new(op))
    }

    /// Read bytes without storing them
    pub fn discard() -> Self {
        Sink::custom(Discard)
    }

    pub fn from_fn<F: FnMut(u8) + Send + 'static>(f: F) -> Self {
        Sink::custom(FnSink(f))
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Sink::Custom(_))
    }

    /// Check there is room for the next byte before the peripheral is asked
    /// for it, so an overrun never swallows a byte from the wire.
    pub fn reserve(&self, buffer_len: usize, pointer: u16) -> Result<()> {
        match self {
            Sink::Linear if usize::from(pointer) >= buffer_len => Err(overrun(pointer, buffer_len)),
            _ => Ok(()),
        }
    }

    pub fn write_one(&mut self, buffer: &mut [u8], pointer: u16, byte: u8) -> Result<()> {
        match self {
            Sink::Linear => {
                let len = buffer.len();
                let slot = buffer.get_mut(usize::from(pointer)).ok_or_else(|| overrun(pointer, len))?;
                *slot = byte;
                Ok(())
            }
            Sink::Custom(op) => op.write_one(buffer, byte),
        }
    }

    pub fn reset(&mut self) {
        if let Sink::Custom(op) = self {
            debug!("resetting custom sink");
            op.teardown();
        }
        *self = Sink::Linear;
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Linear => write!(f, "Linear"),
            Sink::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

// ============================================================================
// Built-in Custom Operations
// ============================================================================

/// Drops every byte
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl SinkOp for Discard {
    fn write_one(&mut self, _buffer: &mut [u8], _byte: u8) -> Result<()> {
        Ok(())
    }
}

/// Supplies the same byte over and over
#[derive(Debug, Clone, Copy)]
pub struct Fill(pub u8);

impl SourceOp for Fill {
    fn read_one(&mut self, _buffer: &[u8]) -> Result<u8> {
        Ok(self.0)
    }
}

/// Indexed access: byte `n` of the transfer lives at `operand + n` of the
/// buffer, independent of the engine pointer.
#[derive(Debug, Clone, Copy)]
pub struct Indexed {
    operand: u16,
    index: u16,
}

impl Indexed {
    pub fn new(operand: u16) -> Self {
        Indexed { operand, index: 0 }
    }

    fn next_offset(&mut self) -> u16 {
        let offset = self.operand.wrapping_add(self.index);
        self.index = self.index.wrapping_add(1);
        offset
    }
}

impl SourceOp for Indexed {
    fn read_one(&mut self, buffer: &[u8]) -> Result<u8> {
        let offset = self.next_offset();
        buffer.get(usize::from(offset)).copied().ok_or_else(|| overrun(offset, buffer.len()))
    }

    fn teardown(&mut self) {
        self.index = 0;
    }
}

impl SinkOp for Indexed {
    fn write_one(&mut self, buffer: &mut [u8], byte: u8) -> Result<()> {
        let offset = self.next_offset();
        let len = buffer.len();
        let slot = buffer.get_mut(usize::from(offset)).ok_or_else(|| overrun(offset, len))?;
        *slot = byte;
        Ok(())
    }

    fn teardown(&mut self) {
        self.index = 0;
    }
}

/// Hands every byte to a closure
pub struct FnSink<F>(pub F);

impl<F: FnMut(u8) + Send> SinkOp for FnSink<F> {
    fn write_one(&mut self, _buffer: &mut [u8], byte: u8) -> Result<()> {
        (self.0)(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_linear_source_reads_at_pointer() {
        let mut source = Source::default();
        let data = [10u8, 20, 30];
        assert_eq!(source.read_one(&data, 0).unwrap(), 10);
        assert_eq!(source.read_one(&data, 2).unwrap(), 30);
        assert!(matches!(source.read_one(&data, 3), Err(Error::Overrun { pointer: 3, len: 3 })));
    }

    #[test]
    fn test_linear_sink_reserve_and_write() {
        let mut sink = Sink::default();
        let mut buf = [0u8; 2];
        sink.reserve(buf.len(), 1).unwrap();
        sink.write_one(&mut buf, 1, 0xaa).unwrap();
        assert_eq!(buf, [0, 0xaa]);
        assert!(sink.reserve(buf.len(), 2).is_err());
    }

    #[test]
    fn test_discard_ignores_buffer() {
        let mut sink = Sink::discard();
        let mut buf = [0u8; 0];
        sink.reserve(0, 500).unwrap();
        sink.write_one(&mut buf, 500, 1).unwrap();
        assert!(sink.is_custom());
    }

    #[test]
    fn test_indexed_ignores_pointer() {
        let mut source = Source::custom(Indexed::new(2));
        let data = [0u8, 1, 2, 3, 4];
        assert_eq!(source.read_one(&data, 0).unwrap(), 2);
        assert_eq!(source.read_one(&data, 0).unwrap(), 3);

        let mut sink = Sink::custom(Indexed::new(1));
        let mut buf = [0u8; 3];
        sink.write_one(&mut buf, 0, 7).unwrap();
        sink.write_one(&mut buf, 0, 8).unwrap();
        assert_eq!(buf, [0, 7, 8]);
        assert!(sink.write_one(&mut buf, 0, 9).is_err());
    }

    #[test]
    fn test_fn_sink_and_reset() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let collected = Arc::clone(&seen);
        let mut sink = Sink::from_fn(move |b| collected.lock().unwrap().push(b));
        sink.write_one(&mut [], 0, 1).unwrap();
        sink.write_one(&mut [], 0, 2).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        sink.reset();
        assert!(!sink.is_custom());

        let mut source = Source::custom(Fill(0x20));
        assert_eq!(source.read_one(&[], 9).unwrap(), 0x20);
        source.reset();
        assert!(!source.is_custom());
    }
}
