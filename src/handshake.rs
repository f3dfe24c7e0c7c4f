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

use tracing::trace;

use crate::error::{Error, Result};
use crate::port::Port;

/// Middle counter used in place of a magnitude of 1. The one-shot poll in
/// front of the countdown makes the shortest budget too short otherwise.
const SHORTEST_MIDDLE: u8 = 0x48;

/// Polls per middle-counter step (the inner counter starts at zero and
/// wraps).
const INNER_POLLS: u32 = 256;

/// How long to wait for the peripheral, as an 8-bit magnitude. The wait grows
/// non-linearly: magnitude 1 is roughly 18k polls, 255 roughly 16.7M.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeoutBudget(u8);

/// Starting values of the three countdown stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub inner: u8,
    pub middle: u8,
    pub outer: u8,
}

impl TimeoutBudget {
    pub const MIN: TimeoutBudget = TimeoutBudget(1);
    pub const MAX: TimeoutBudget = TimeoutBudget(u8::MAX);

    /// Zero is coerced to one.
    pub const fn new(magnitude: u8) -> Self {
        if magnitude == 0 {
            TimeoutBudget(1)
        } else {
            TimeoutBudget(magnitude)
        }
    }

    pub fn magnitude(self) -> u8 {
        self.0
    }

    pub fn counters(self) -> Counters {
        Counters {
            inner: 0,
            middle: if self.0 == 1 { SHORTEST_MIDDLE } else { self.0 },
            outer: self.0,
        }
    }

    /// Number of polls the countdown performs before giving up
    pub fn polls(self) -> u32 {
        let Counters { middle, outer, .. } = self.counters();
        INNER_POLLS * (u32::from(middle) + 256 * (u32::from(outer) - 1))
    }

    /// Wall-clock bound of the countdown when every poll costs `per_poll`
    pub fn wall_clock(self, per_poll: Duration) -> Duration {
        per_poll.saturating_mul(self.polls())
    }
}

impl Default for TimeoutBudget {
    fn default() -> Self {
        TimeoutBudget(2)
    }
}

impl From<u8> for TimeoutBudget {
    fn from(magnitude: u8) -> Self {
        TimeoutBudget::new(magnitude)
    }
}

/// Wait for one handshake from the peripheral.
///
/// A line that is already asserted returns at once without touching the
/// counters. Otherwise a fresh three-stage countdown runs until the line
/// asserts or every stage underflows, sleeping `poll_interval` between polls
/// when it is non-zero. A timeout reports zero bytes moved; the caller knows
/// the real count.
pub fn wait_for_signal<P: Port + ?Sized>(
    port: &mut P,
    budget: TimeoutBudget,
    poll_interval: Duration,
) -> Result<()> {
    if port.signal_asserted()? {
        return Ok(());
    }

    let Counters { mut inner, mut middle, mut outer } = budget.counters();

    loop {
        if port.signal_asserted()? {
            return Ok(());
        }
        if !poll_interval.is_zero() {
            std::thread::sleep(poll_interval);
        }

        inner = inner.wrapping_sub(1);
        if inner != 0 {
            continue;
        }
        middle = middle.wrapping_sub(1);
        if middle != 0 {
            continue;
        }
        outer = outer.wrapping_sub(1);
        if outer != 0 {
            continue;
        }

        trace!(magnitude = budget.magnitude(), "handshake countdown expired");
        return Err(Error::Timeout { moved: 0 });
    }
}
