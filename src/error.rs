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

use crate::protocol::Status;
use crate::recovery::Resumed;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peripheral did not assert the handshake line within the budget.
    /// `moved` counts the bytes that made it across before the stall.
    #[error("handshake timed out after {moved} byte(s)")]
    Timeout { moved: u16 },

    /// The response header carried a non-success status
    #[error("device reported {0}")]
    Device(Status),

    /// A recovery point fired. Travels up to the dispatcher that sits at
    /// the depth the point was armed at.
    #[error("unwinding to recovery point {}: {}", .0.resume_at, .0.fault)]
    Unwound(Resumed),

    #[error("linear buffer overrun at offset {pointer} (buffer holds {len} bytes)")]
    Overrun { pointer: u16, len: usize },

    #[error("payload of {0} bytes does not fit a 16-bit length field")]
    PayloadTooLarge(usize),

    #[error("response declares {declared} bytes but the buffer holds {capacity}")]
    ResponseTooLarge { declared: u16, capacity: usize },

    #[error("program image of {0} bytes is too short to carry a load address")]
    InvalidProgram(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
