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

//! Host-side driver for the WiC64 userport network adapter.
//!
//! Bytes move one at a time under a handshake line with a bounded wait;
//! requests and responses are framed in a three-byte envelope. A stalled
//! peripheral either surfaces as [`Error::Timeout`] or, when a recovery
//! point is armed, resumes the caller at that point through [`Flow::Resumed`].

pub mod error;
pub mod handshake;
pub mod port;
pub mod program;
pub mod protocol;
pub mod recovery;
pub mod session;
pub mod sim;
pub mod strategy;
pub mod transfer;

pub use error::{Error, Result};
pub use handshake::TimeoutBudget;
pub use port::{HandshakeLine, Port, SerialBridge};
pub use program::{Launcher, Memory, PrgWriter, Program};
pub use protocol::{Command, Request, ResponseHeader, Status};
pub use recovery::{Address, Fault, Flow, Resumed, Trigger};
pub use session::{Config, Phase, Reply, Session};
pub use strategy::{Sink, Source};
pub use transfer::TransferCursor;
