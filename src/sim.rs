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

use std::collections::{HashMap, VecDeque};
use std::io;

use tracing::trace;

use crate::port::Port;
use crate::protocol::{Command, ResponseHeader, Status, REQUEST_HEADER_LEN};

/// What the simulated peripheral does with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behaviour {
    Respond { status: Status, payload: Vec<u8> },
    /// Never answer; the line stays low until the simulator is reset
    Silent,
}

impl Behaviour {
    pub fn respond(status: Status, payload: Vec<u8>) -> Self {
        Behaviour::Respond { status, payload }
    }

    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        Behaviour::respond(Status::Success, payload.into())
    }
}

type Handler = Box<dyn FnMut(&[u8]) -> Behaviour + Send>;

enum State {
    Header(Vec<u8>),
    Payload { opcode: u8, length: usize, payload: Vec<u8> },
    Responding(VecDeque<u8>),
    Silent,
}

/// In-process peripheral behind the [`Port`] boundary. Answers from a
/// built-in command set or registered handlers.
pub struct Simulator {
    state: State,
    responsive: bool,
    latency: u32,
    waited: u32,
    handlers: HashMap<u8, Handler>,
    pages: HashMap<String, Vec<u8>>,
    status_message: String,
    requests: Vec<(u8, Vec<u8>)>,
    masked: bool,
    mask_history: Vec<bool>,
    polls: u64,
}

impl Simulator {
    pub fn new() -> Self {
        Simulator {
            state: State::Header(Vec::new()),
            responsive: true,
            latency: 0,
            waited: 0,
            handlers: HashMap::new(),
            pages: HashMap::new(),
            status_message: String::from("SUCCESS"),
            requests: Vec::new(),
            masked: false,
            mask_history: Vec::new(),
            polls: 0,
        }
    }

    /// A peripheral that never asserts the handshake line
    pub fn unresponsive() -> Self {
        let mut sim = Simulator::new();
        sim.responsive = false;
        sim
    }

    /// Hold the line low for `polls` polls before every handshake
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    /// Bringing the peripheral back also ends a forced silence
    pub fn set_responsive(&mut self, responsive: bool) {
        self.responsive = responsive;
        if responsive && matches!(self.state, State::Silent) {
            self.state = State::Header(Vec::new());
        }
    }

    /// Drop any half-finished exchange, as after a power cycle
    pub fn reset(&mut self) {
        self.state = State::Header(Vec::new());
        self.waited = 0;
    }

    /// Answer `command` with `handler` instead of the built-in behaviour
    pub fn on<F>(&mut self, command: impl Into<u8>, handler: F)
    where
        F: FnMut(&[u8]) -> Behaviour + Send + 'static,
    {
        self.handlers.insert(command.into(), Box::new(handler));
    }

    /// Content returned for HTTP GET requests of `url`
    pub fn serve(&mut self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.pages.insert(url.into(), body.into());
    }

    /// Every complete request seen so far, as opcode and payload
    pub fn requests(&self) -> &[(u8, Vec<u8>)] {
        &self.requests
    }

    pub fn mask_history(&self) -> &[bool] {
        &self.mask_history
    }

    pub fn interrupts_masked(&self) -> bool {
        self.masked
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    fn dispatch(&mut self, opcode: u8, payload: Vec<u8>) {
        trace!(opcode, length = payload.len(), "simulator received request");
        let behaviour = match self.handlers.get_mut(&opcode) {
            Some(handler) => handler(&payload),
            None => self.builtin(opcode, &payload),
        };
        self.requests.push((opcode, payload));

        self.state = match behaviour {
            Behaviour::Respond { status, payload } => {
                let length = u16::try_from(payload.len()).unwrap_or(u16::MAX);
                let mut queue: VecDeque<u8> = ResponseHeader { status, length }.to_bytes().into_iter().collect();
                queue.extend(payload.into_iter().take(usize::from(length)));
                State::Responding(queue)
            }
            Behaviour::Silent => State::Silent,
        };
    }

    fn fail(&mut self, status: Status, message: String) -> Behaviour {
        self.status_message = message;
        Behaviour::respond(status, Vec::new())
    }

    fn builtin(&mut self, opcode: u8, payload: &[u8]) -> Behaviour {
        let Some(command) = Command::from_opcode(opcode) else {
            return self.fail(Status::ClientError, format!("unknown command 0x{:02X}", opcode));
        };

        let reply = match command {
            Command::Echo => Behaviour::ok(payload),
            Command::GetVersionString => Behaviour::ok("2.1.0-sim"),
            Command::GetVersionNumbers => Behaviour::ok([2u8, 1, 0, 0]),
            Command::GetStatusMessage => Behaviour::ok(self.status_message.as_bytes()),
            Command::GetIp => Behaviour::ok("192.168.0.64"),
            Command::GetMac => Behaviour::ok("02:00:00:c0:64:64"),
            Command::GetSsid => Behaviour::ok("simnet"),
            Command::GetRssi => Behaviour::ok("-42"),
            Command::IsConnected => Behaviour::respond(Status::Success, Vec::new()),
            Command::HttpGet | Command::HttpGetEncoded => {
                let url = String::from_utf8_lossy(payload).into_owned();
                match self.pages.get(&url) {
                    Some(body) => Behaviour::ok(body.clone()),
                    None => return self.fail(Status::ServerError, format!("404 for {}", url)),
                }
            }
            Command::ForceTimeout => return Behaviour::Silent,
            Command::ForceError => return self.fail(Status::InternalError, String::from("forced error")),
            other => return self.fail(Status::ClientError, format!("{:?} not simulated", other)),
        };
        self.status_message = String::from("SUCCESS");
        reply
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Simulator::new()
    }
}

impl Port for Simulator {
    fn signal_asserted(&mut self) -> io::Result<bool> {
        self.polls += 1;
        if !self.responsive || matches!(self.state, State::Silent) {
            return Ok(false);
        }
        if self.waited < self.latency {
            self.waited += 1;
            return Ok(false);
        }
        self.waited = 0;
        Ok(true)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let State::Responding(queue) = &mut self.state else {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no response pending"));
        };
        let byte = queue
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "response exhausted"))?;
        if queue.is_empty() {
            self.state = State::Header(Vec::new());
        }
        Ok(byte)
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        let state = std::mem::replace(&mut self.state, State::Header(Vec::new()));
        self.state = match state {
            State::Header(mut header) => {
                header.push(byte);
                if header.len() < REQUEST_HEADER_LEN {
                    State::Header(header)
                } else {
                    let length = usize::from(u16::from_le_bytes([header[1], header[2]]));
                    if length == 0 {
                        self.dispatch(header[0], Vec::new());
                        return Ok(());
                    }
                    State::Payload { opcode: header[0], length, payload: Vec::with_capacity(length) }
                }
            }
            State::Payload { opcode, length, mut payload } => {
                payload.push(byte);
                if payload.len() == length {
                    self.dispatch(opcode, payload);
                    return Ok(());
                }
                State::Payload { opcode, length, payload }
            }
            // the host gave up on the previous response and starts over
            State::Responding(_) | State::Silent => State::Header(vec![byte]),
        };
        Ok(())
    }

    fn set_interrupt_mask(&mut self, masked: bool) -> io::Result<bool> {
        self.mask_history.push(masked);
        Ok(std::mem::replace(&mut self.masked, masked))
    }
}
