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

use std::time::Duration;

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::handshake::{wait_for_signal, TimeoutBudget};
use crate::port::Port;
use crate::strategy::{Sink, Source};

// ============================================================================
// Transfer Cursor
// ============================================================================

/// Bookkeeping for one logical message moved in one or more transfer calls.
///
/// `remaining` only shrinks through [`TransferCursor::update_after_transfer`];
/// the transfer calls themselves just record what they moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCursor {
    remaining: u16,
    requested: Option<u16>,
    moved: u16,
    pointer: u16,
    declared: bool,
}

impl TransferCursor {
    /// Start a new message of `length` bytes at the start of its buffer
    pub fn declare(&mut self, length: u16) {
        *self = TransferCursor { remaining: length, declared: true, ..TransferCursor::default() };
    }

    /// Move exactly `count` bytes in the next transfer call
    pub fn request(&mut self, count: u16) {
        self.requested = Some(count);
    }

    /// Move everything not yet moved since the last declaration. Without a
    /// declaration there is nothing to request.
    pub fn request_remaining(&mut self) {
        self.requested = self.declared.then_some(self.remaining);
    }

    pub(crate) fn take_request(&mut self) -> Option<u16> {
        self.requested.take()
    }

    /// Subtract the bytes moved by the previous call from `remaining`
    pub fn update_after_transfer(&mut self) -> u16 {
        self.remaining = self.remaining.saturating_sub(self.moved);
        self.moved = 0;
        self.remaining
    }

    pub fn remaining(&self) -> u16 {
        self.remaining
    }

    /// Bytes moved by the most recent transfer call
    pub fn moved(&self) -> u16 {
        self.moved
    }

    pub fn pointer(&self) -> u16 {
        self.pointer
    }

    pub fn set_pointer(&mut self, pointer: u16) {
        self.pointer = pointer;
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

// ============================================================================
// Link
// ============================================================================

/// The port plus the timing parameters for one transfer call
pub struct Link<'p, P: Port + ?Sized> {
    port: &'p mut P,
    budget: TimeoutBudget,
    poll_interval: Duration,
}

impl<'p, P: Port + ?Sized> Link<'p, P> {
    pub fn new(port: &'p mut P, budget: TimeoutBudget, poll_interval: Duration) -> Self {
        Link { port, budget, poll_interval }
    }

    fn handshake(&mut self) -> Result<()> {
        wait_for_signal(self.port, self.budget, self.poll_interval)
    }

    pub fn put(&mut self, byte: u8) -> Result<()> {
        self.handshake()?;
        self.port.write_byte(byte)?;
        trace!("sent 0x{:02X}", byte);
        Ok(())
    }

    pub fn get(&mut self) -> Result<u8> {
        self.handshake()?;
        let byte = self.port.read_byte()?;
        trace!("received 0x{:02X}", byte);
        Ok(byte)
    }

    /// Send a fixed block, reporting how far it got on timeout
    pub fn put_all(&mut self, bytes: &[u8]) -> Result<()> {
        for (i, &byte) in bytes.iter().enumerate() {
            self.put(byte).map_err(|e| with_moved(e, i))?;
        }
        Ok(())
    }

    pub fn get_exact(&mut self, bytes: &mut [u8]) -> Result<()> {
        for i in 0..bytes.len() {
            bytes[i] = self.get().map_err(|e| with_moved(e, i))?;
        }
        Ok(())
    }

    /// Send the requested number of bytes from `source`.
    ///
    /// The byte count moved is kept in the cursor on every path, including
    /// a timeout part way through.
    pub fn send(&mut self, cursor: &mut TransferCursor, source: &mut Source, buffer: &[u8]) -> Result<u16> {
        cursor.moved = 0;
        let Some(count) = cursor.take_request() else {
            warn!("send without a declared size, nothing transferred");
            return Ok(0);
        };

        while cursor.moved < count {
            let byte = source.read_one(buffer, cursor.pointer)?;
            self.put(byte).map_err(|e| with_moved(e, usize::from(cursor.moved)))?;
            cursor.moved += 1;
            if !source.is_custom() {
                cursor.pointer = cursor.pointer.wrapping_add(1);
            }
        }
        Ok(cursor.moved)
    }

    /// Receive the requested number of bytes into `sink`
    pub fn receive(&mut self, cursor: &mut TransferCursor, sink: &mut Sink, buffer: &mut [u8]) -> Result<u16> {
        cursor.moved = 0;
        let Some(count) = cursor.take_request() else {
            warn!("receive without a declared size, nothing transferred");
            return Ok(0);
        };

        while cursor.moved < count {
            sink.reserve(buffer.len(), cursor.pointer)?;
            let byte = self.get().map_err(|e| with_moved(e, usize::from(cursor.moved)))?;
            sink.write_one(buffer, cursor.pointer, byte)?;
            cursor.moved += 1;
            if !sink.is_custom() {
                cursor.pointer = cursor.pointer.wrapping_add(1);
            }
        }
        Ok(cursor.moved)
    }
}

fn with_moved(error: Error, moved: usize) -> Error {
    match error {
        Error::Timeout { .. } => Error::Timeout { moved: u16::try_from(moved).unwrap_or(u16::MAX) },
        other => other,
    }
}
