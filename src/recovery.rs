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

//! Recovery points for timeouts and device errors.
//!
//! A recovery point remembers where to resume and the call depth at which it
//! was armed. When it fires, an [`Error::Unwound`] carrying that depth is
//! returned from the faulting call and travels through every frame above it
//! until a dispatcher at the armed depth turns it into [`Flow::Resumed`].
//! Frames that sit deeper than the armed depth never swallow it.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::Status;

/// Where execution continues after a recovery point fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub u16);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:04x}", self.0)
    }
}

/// Which of the two recovery points a fault is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timeout,
    DeviceError,
}

/// The condition that fired a recovery point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Handshake timeout after `moved` bytes of the interrupted transfer
    Timeout { moved: u16 },
    Device(Status),
}

impl Fault {
    pub fn trigger(self) -> Trigger {
        match self {
            Fault::Timeout { .. } => Trigger::Timeout,
            Fault::Device(_) => Trigger::DeviceError,
        }
    }

    fn into_error(self) -> Error {
        match self {
            Fault::Timeout { moved } => Error::Timeout { moved },
            Fault::Device(status) => Error::Device(status),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Timeout { moved } => write!(f, "timeout after {} byte(s)", moved),
            Fault::Device(status) => write!(f, "device reported {}", status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub resume_at: Address,
    depth: usize,
}

impl RecoveryPoint {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// A recovery point that has fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resumed {
    pub resume_at: Address,
    pub fault: Fault,
    depth: usize,
}

/// Outcome of an operation run under a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<T> {
    Completed(T),
    Resumed(Resumed),
}

impl<T> Flow<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Flow::Completed(value) => Some(value),
            Flow::Resumed(_) => None,
        }
    }

    pub fn resumed(&self) -> Option<&Resumed> {
        match self {
            Flow::Completed(_) => None,
            Flow::Resumed(resumed) => Some(resumed),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Flow<U> {
        match self {
            Flow::Completed(value) => Flow::Completed(f(value)),
            Flow::Resumed(resumed) => Flow::Resumed(resumed),
        }
    }
}

/// Owns the two recovery points and the call-depth marker they record.
#[derive(Debug, Default)]
pub struct Controller {
    depth: usize,
    dispatchers: usize,
    on_timeout: Option<RecoveryPoint>,
    on_error: Option<RecoveryPoint>,
}

/// Both recovery points, taken out of a controller for safekeeping
#[derive(Debug, Default)]
pub(crate) struct Stashed {
    on_timeout: Option<RecoveryPoint>,
    on_error: Option<RecoveryPoint>,
}

impl Controller {
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn enter(&mut self) {
        self.depth += 1;
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub(crate) fn open_dispatcher(&mut self) {
        self.dispatchers += 1;
    }

    pub(crate) fn close_dispatcher(&mut self) {
        self.dispatchers = self.dispatchers.saturating_sub(1);
    }

    fn slot(&mut self, trigger: Trigger) -> &mut Option<RecoveryPoint> {
        match trigger {
            Trigger::Timeout => &mut self.on_timeout,
            Trigger::DeviceError => &mut self.on_error,
        }
    }

    /// Arm a recovery point at the current depth, replacing any previous one
    /// for the same trigger. The other trigger's point is left alone.
    pub fn arm(&mut self, trigger: Trigger, resume_at: Address) {
        let point = RecoveryPoint { resume_at, depth: self.depth };
        debug!(?trigger, %resume_at, depth = self.depth, "recovery point armed");
        *self.slot(trigger) = Some(point);
    }

    pub fn disarm(&mut self, trigger: Trigger) -> Option<RecoveryPoint> {
        self.slot(trigger).take()
    }

    pub fn disarm_all(&mut self) {
        self.on_timeout = None;
        self.on_error = None;
    }

    pub fn armed(&self, trigger: Trigger) -> Option<&RecoveryPoint> {
        match trigger {
            Trigger::Timeout => self.on_timeout.as_ref(),
            Trigger::DeviceError => self.on_error.as_ref(),
        }
    }

    /// Route a fault. With a point armed for it, the point is consumed and
    /// the returned error unwinds to it; otherwise the fault comes back as a
    /// plain error for the immediate caller.
    pub fn fire(&mut self, fault: Fault) -> Error {
        match self.slot(fault.trigger()).take() {
            Some(point) => {
                warn!(%fault, resume_at = %point.resume_at, "recovery point fired");
                Error::Unwound(Resumed { resume_at: point.resume_at, fault, depth: point.depth })
            }
            None => {
                warn!(%fault, "no recovery point armed");
                fault.into_error()
            }
        }
    }

    /// Dispatcher: resolve an unwind aimed at the current depth. Anything else
    /// passes through untouched.
    pub fn catch<T>(&self, result: Result<T>) -> Result<Flow<T>> {
        match result {
            Ok(value) => Ok(Flow::Completed(value)),
            Err(Error::Unwound(resumed)) if resumed.depth == self.depth => Ok(Flow::Resumed(resumed)),
            Err(e) => Err(e),
        }
    }

    /// Dispatcher of an orchestrated operation. While an explicit dispatcher
    /// is open around it, unwinds are left for that one to resolve.
    pub(crate) fn catch_unless_dispatching<T>(&self, result: Result<T>) -> Result<Flow<T>> {
        if self.dispatchers > 0 {
            return result.map(Flow::Completed);
        }
        self.catch(result)
    }

    pub(crate) fn stash(&mut self) -> Stashed {
        Stashed { on_timeout: self.on_timeout.take(), on_error: self.on_error.take() }
    }

    pub(crate) fn restore(&mut self, stashed: Stashed) {
        self.on_timeout = stashed.on_timeout;
        self.on_error = stashed.on_error;
    }
}
