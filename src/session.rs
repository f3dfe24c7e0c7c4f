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

//! Session context and the orchestrated request/response operations.
//!
//! A [`Session`] owns everything that would otherwise be process-wide state:
//! the current timeout, both recovery points, the transfer cursor and the
//! installed source and sink. The low-level calls can be composed by hand;
//! [`Session::execute`], [`Session::detect`] and [`Session::load_and_run`]
//! compose them the usual way.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handshake::TimeoutBudget;
use crate::port::Port;
use crate::program::{Launcher, Memory, Program};
use crate::protocol::{Command, Request, ResponseHeader, Status, RESPONSE_HEADER_LEN};
use crate::recovery::{Address, Controller, Fault, Flow, Trigger};
use crate::strategy::{Sink, Source};
use crate::transfer::{Link, TransferCursor};

/// Magnitude used by `detect`
const PROBE_TIMEOUT: TimeoutBudget = TimeoutBudget::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Baseline restored after every orchestrated operation
    pub timeout: TimeoutBudget,
    /// Mask host interrupts while bytes are moving
    pub mask_interrupts: bool,
    /// Pause between handshake polls; zero spins
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: TimeoutBudget::default(),
            mask_interrupts: true,
            poll_interval: Duration::ZERO,
        }
    }
}

/// Where an orchestrated operation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Arming,
    SendingHeader,
    SendingPayload,
    ReceivingHeader,
    ReceivingPayload,
    Finalized,
    Recovered,
}

/// Result of a completed `execute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    /// Declared payload length of the response
    pub length: u16,
}

pub struct Session<P: Port> {
    port: P,
    config: Config,
    timeout: TimeoutBudget,
    recovery: Controller,
    cursor: TransferCursor,
    source: Source,
    sink: Sink,
    phase: Phase,
}

impl<P: Port> Session<P> {
    pub fn new(port: P, config: Config) -> Self {
        Session {
            port,
            config,
            timeout: config.timeout,
            recovery: Controller::default(),
            cursor: TransferCursor::default(),
            source: Source::default(),
            sink: Sink::default(),
            phase: Phase::Idle,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors & configuration
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cursor(&self) -> &TransferCursor {
        &self.cursor
    }

    pub fn recovery(&self) -> &Controller {
        &self.recovery
    }

    pub fn timeout(&self) -> TimeoutBudget {
        self.timeout
    }

    /// Timeout for the transfers that follow, until the next finalize
    pub fn set_timeout(&mut self, budget: impl Into<TimeoutBudget>) {
        self.timeout = budget.into();
    }

    /// Change the baseline that finalize restores
    pub fn set_default_timeout(&mut self, budget: impl Into<TimeoutBudget>) {
        self.config.timeout = budget.into();
        self.timeout = self.config.timeout;
    }

    pub fn set_mask_interrupts(&mut self, mask: bool) {
        self.config.mask_interrupts = mask;
    }

    /// Resume at `at` if a handshake times out before the next finalize
    pub fn branch_on_timeout(&mut self, at: Address) {
        self.recovery.arm(Trigger::Timeout, at);
    }

    /// Resume at `at` if the peripheral answers with an error status
    pub fn branch_on_error(&mut self, at: Address) {
        self.recovery.arm(Trigger::DeviceError, at);
    }

    pub fn install_source(&mut self, source: Source) {
        self.source.reset();
        self.source = source;
    }

    pub fn install_sink(&mut self, sink: Sink) {
        self.sink.reset();
        self.sink = sink;
    }

    pub fn reset_source(&mut self) {
        self.source.reset();
    }

    pub fn reset_sink(&mut self) {
        self.sink.reset();
    }

    // ------------------------------------------------------------------------
    // Cursor bookkeeping
    // ------------------------------------------------------------------------

    /// Position the linear buffer pointer for the next transfer. The header
    /// calls start a new message at offset zero, so this has to follow them.
    pub fn set_pointer(&mut self, pointer: u16) {
        self.cursor.set_pointer(pointer);
    }

    pub fn set_transfer_size(&mut self, count: u16) {
        self.cursor.request(count);
    }

    pub fn prepare_transfer_of_remaining_bytes(&mut self) {
        self.cursor.request_remaining();
    }

    pub fn update_transfer_size_after_transfer(&mut self) -> u16 {
        self.cursor.update_after_transfer()
    }

    // ------------------------------------------------------------------------
    // Frames, faults and the dispatcher
    // ------------------------------------------------------------------------

    fn frame<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.recovery.enter();
        let result = f(self);
        self.recovery.leave();
        result
    }

    /// One handshake-driven transfer: interrupts masked per policy and
    /// restored on every path, timeouts routed to the recovery controller.
    fn transfer<T>(
        &mut self,
        op: impl FnOnce(&mut Link<'_, P>, &mut TransferCursor, &mut Source, &mut Sink) -> Result<T>,
    ) -> Result<T> {
        self.frame(|s| {
            let previous = if s.config.mask_interrupts {
                Some(s.port.set_interrupt_mask(true)?)
            } else {
                None
            };

            let mut link = Link::new(&mut s.port, s.timeout, s.config.poll_interval);
            let result = op(&mut link, &mut s.cursor, &mut s.source, &mut s.sink).map_err(|e| match e {
                Error::Timeout { moved } => s.recovery.fire(Fault::Timeout { moved }),
                other => other,
            });

            if let Some(previous) = previous {
                if let Err(e) = s.port.set_interrupt_mask(previous) {
                    warn!("failed to restore interrupt mask: {}", e);
                    if result.is_ok() {
                        return Err(e.into());
                    }
                }
            }
            result
        })
    }

    /// Run `body` with this call as the resumption target: a recovery point
    /// armed at the current depth that fires inside `body` comes back as
    /// [`Flow::Resumed`], even when it fires inside a nested `execute` or
    /// `load_and_run`. The rest of `body` is skipped. The operation is
    /// finalized on both outcomes.
    pub fn run<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<Flow<T>> {
        self.recovery.open_dispatcher();
        let result = body(self);
        self.recovery.close_dispatcher();
        let flow = self.recovery.catch(result);
        self.settle(flow)
    }

    fn begin(&mut self, timeout: TimeoutBudget) {
        self.phase = Phase::Arming;
        self.timeout = timeout;
        debug!(timeout = timeout.magnitude(), depth = self.recovery.depth(), "operation started");
    }

    fn settle<T>(&mut self, flow: Result<Flow<T>>) -> Result<Flow<T>> {
        self.finalize();
        if let Ok(Flow::Resumed(resumed)) = &flow {
            info!(resume_at = %resumed.resume_at, fault = %resumed.fault, "resumed at recovery point");
            self.phase = Phase::Recovered;
        }
        flow
    }

    /// Close the current operation: disarm both recovery points, tear down
    /// custom strategies and restore the baseline timeout.
    pub fn finalize(&mut self) {
        self.recovery.disarm_all();
        self.source.reset();
        self.sink.reset();
        self.timeout = self.config.timeout;
        self.phase = Phase::Finalized;
        debug!("operation finalized");
    }

    // ------------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------------

    /// Send command and declared length, and declare the request size for
    /// the payload transfer that follows. The buffer pointer restarts at zero.
    pub fn send_header(&mut self, request: &Request<'_>) -> Result<()> {
        self.phase = Phase::SendingHeader;
        let header = request.header()?;
        debug!(opcode = request.opcode(), length = request.payload().len(), "sending request header");

        self.transfer(|link, _, _, _| link.put_all(&header))?;
        self.cursor.declare(request.payload().len() as u16);
        Ok(())
    }

    /// Receive status and declared length, and declare the response size with
    /// the buffer pointer back at zero. A non-success status fires the error
    /// recovery point when one is armed.
    pub fn receive_header(&mut self) -> Result<ResponseHeader> {
        self.phase = Phase::ReceivingHeader;
        let raw = self.transfer(|link, _, _, _| {
            let mut raw = [0u8; RESPONSE_HEADER_LEN];
            link.get_exact(&mut raw)?;
            Ok(raw)
        })?;

        let header = ResponseHeader::from_bytes(raw);
        debug!(status = %header.status, length = header.length, "received response header");
        self.cursor.declare(header.length);

        if !header.status.is_success() {
            warn!(status = %header.status, "device reported an error");
            if self.recovery.armed(Trigger::DeviceError).is_some() {
                return Err(self.recovery.fire(Fault::Device(header.status)));
            }
        }
        Ok(header)
    }

    pub fn send(&mut self, data: &[u8]) -> Result<u16> {
        self.phase = Phase::SendingPayload;
        self.transfer(|link, cursor, source, _| link.send(cursor, source, data))
    }

    pub fn receive(&mut self, buffer: &mut [u8]) -> Result<u16> {
        self.phase = Phase::ReceivingPayload;
        self.transfer(|link, cursor, _, sink| link.receive(cursor, sink, buffer))
    }

    /// Read whatever is left of the current response without storing it
    fn discard_remaining(&mut self) -> Result<u16> {
        let previous = std::mem::replace(&mut self.sink, Sink::discard());
        self.prepare_transfer_of_remaining_bytes();
        let result = self.receive(&mut []);
        self.sink = previous;
        result?;
        Ok(self.update_transfer_size_after_transfer())
    }

    // ------------------------------------------------------------------------
    // Orchestrated operations
    // ------------------------------------------------------------------------

    /// Send `request` and receive the response payload into `response`.
    ///
    /// A fired recovery point comes back as [`Flow::Resumed`]; without one,
    /// timeouts are errors and the status byte is reported in the [`Reply`].
    pub fn execute(
        &mut self,
        request: &Request<'_>,
        response: &mut [u8],
        timeout: impl Into<TimeoutBudget>,
    ) -> Result<Flow<Reply>> {
        self.begin(timeout.into());
        let result = self.frame(|s| s.exchange(request, response));
        let flow = self.recovery.catch_unless_dispatching(result);
        self.settle(flow)
    }

    fn exchange(&mut self, request: &Request<'_>, response: &mut [u8]) -> Result<Reply> {
        self.send_header(request)?;
        self.prepare_transfer_of_remaining_bytes();
        self.send(request.payload())?;
        self.update_transfer_size_after_transfer();

        let header = self.receive_header()?;
        if !header.status.is_success() {
            self.discard_remaining()?;
            return Ok(Reply { status: header.status, length: header.length });
        }
        if !self.sink.is_custom() && usize::from(header.length) > response.len() {
            self.discard_remaining()?;
            return Err(Error::ResponseTooLarge { declared: header.length, capacity: response.len() });
        }

        self.prepare_transfer_of_remaining_bytes();
        self.receive(response)?;
        self.update_transfer_size_after_transfer();

        Ok(Reply { status: header.status, length: header.length })
    }

    /// Probe for a peripheral with a short timeout. Recovery points armed by
    /// the caller are kept out of the probe and left armed afterwards.
    pub fn detect(&mut self) -> bool {
        let stashed = self.recovery.stash();
        self.begin(PROBE_TIMEOUT);

        let probe = Request::empty(Command::Echo);
        let result = self.frame(|s| {
            s.send_header(&probe)?;
            let header = s.receive_header()?;
            if header.length > 0 {
                s.discard_remaining()?;
            }
            Ok(header)
        });

        self.timeout = self.config.timeout;
        self.recovery.restore(stashed);
        self.phase = Phase::Finalized;

        match result {
            Ok(header) => {
                info!(status = %header.status, "peripheral detected");
                true
            }
            Err(e) => {
                info!("no peripheral detected: {}", e);
                false
            }
        }
    }

    /// Fetch a program image and hand it to `launcher`.
    ///
    /// The response payload starts with the load address; the rest is
    /// received straight into `memory` at that address. Faults behave as for
    /// [`Session::execute`]; an error status without an armed recovery point
    /// is returned as [`Error::Device`].
    pub fn load_and_run<L: Launcher + ?Sized>(
        &mut self,
        request: &Request<'_>,
        timeout: impl Into<TimeoutBudget>,
        memory: &mut Memory,
        launcher: &mut L,
    ) -> Result<Flow<Program>> {
        self.begin(timeout.into());
        let result = self.frame(|s| s.load(request, memory));
        let flow = self.recovery.catch_unless_dispatching(result);
        let flow = self.settle(flow)?;
        if let Flow::Completed(program) = &flow {
            launcher.launch(memory, program)?;
        }
        Ok(flow)
    }

    fn load(&mut self, request: &Request<'_>, memory: &mut Memory) -> Result<Program> {
        self.reset_sink();
        self.send_header(request)?;
        self.prepare_transfer_of_remaining_bytes();
        self.send(request.payload())?;
        self.update_transfer_size_after_transfer();

        let header = self.receive_header()?;
        if !header.status.is_success() {
            self.discard_remaining()?;
            return Err(Error::Device(header.status));
        }
        if header.length < 2 {
            self.discard_remaining()?;
            return Err(Error::InvalidProgram(header.length));
        }

        let mut address = [0u8; 2];
        self.set_transfer_size(2);
        self.receive(&mut address)?;
        self.update_transfer_size_after_transfer();

        let load_address = u16::from_le_bytes(address);
        self.set_pointer(load_address);
        self.prepare_transfer_of_remaining_bytes();
        self.receive(memory.as_mut_slice())?;
        self.update_transfer_size_after_transfer();

        let program = Program { load_address, length: header.length - 2 };
        info!(
            load_address = %Address(program.load_address),
            length = program.length,
            "program image loaded"
        );
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockPort;
    use crate::program::Entry;
    use crate::sim::{Behaviour, Simulator};
    use crate::strategy::Indexed;

    fn new_session(sim: Simulator) -> Session<Simulator> {
        Session::new(sim, Config { timeout: TimeoutBudget::MIN, ..Config::default() })
    }

    struct Recorder(Option<(Program, Vec<u8>)>);

    impl Launcher for Recorder {
        fn launch(&mut self, memory: &Memory, program: &Program) -> Result<()> {
            self.0 = Some((*program, memory.read(program.load_address, program.length)));
            Ok(())
        }
    }

    #[test]
    fn test_execute_wire_format() {
        let expected_writes = vec![0xfe, 0x02, 0x00, 0xab, 0xcd];
        let responses = vec![0x00, 0x02, 0x00, 0xab, 0xcd];
        let port = MockPort::new(responses, expected_writes);
        let mut session = Session::new(port, Config::default());

        let payload = [0xabu8, 0xcd];
        let mut response = [0u8; 8];
        let flow = session.execute(&Request::new(Command::Echo, &payload), &mut response, 2).unwrap();
        assert_eq!(flow, Flow::Completed(Reply { status: Status::Success, length: 2 }));
        assert_eq!(&response[..2], &payload);
        assert_eq!(session.phase(), Phase::Finalized);
    }

    #[test]
    fn test_execute_echo() {
        let mut session = new_session(Simulator::new());
        let mut response = [0u8; 4];
        let flow = session
            .execute(&Request::new(Command::Echo, &[1, 2, 3, 4]), &mut response, 2)
            .unwrap();
        assert_eq!(flow.completed().unwrap().status, Status::Success);
        assert_eq!(response, [1, 2, 3, 4]);
    }

    #[test]
    fn test_execute_restores_baseline_timeout() {
        let mut session = new_session(Simulator::new());
        let mut response = [0u8; 1];
        session.execute(&Request::new(Command::Echo, &[9]), &mut response, 200).unwrap();
        assert_eq!(session.timeout(), TimeoutBudget::MIN);
    }

    #[test]
    fn test_execute_timeout_without_recovery_point() {
        let mut session = new_session(Simulator::unresponsive());
        let mut response = [0u8; 4];
        let err = session.execute(&Request::empty(Command::GetIp), &mut response, 1).unwrap_err();
        assert!(matches!(err, Error::Timeout { moved: 0 }));
        assert_eq!(session.recovery().depth(), 0);
    }

    #[test]
    fn test_execute_timeout_resumes_at_recovery_point() {
        let mut session = new_session(Simulator::unresponsive());
        session.branch_on_timeout(Address(0x4000));

        let mut response = [0xeeu8; 4];
        let flow = session.execute(&Request::new(Command::Echo, &[1]), &mut response, 1).unwrap();
        let resumed = flow.resumed().unwrap();
        assert_eq!(resumed.resume_at, Address(0x4000));
        assert_eq!(resumed.fault, Fault::Timeout { moved: 0 });
        assert_eq!(response, [0xee; 4]);
        assert_eq!(session.phase(), Phase::Recovered);
        assert_eq!(session.port().requests().len(), 0);
    }

    #[test]
    fn test_forced_timeout_after_request() {
        let mut session = new_session(Simulator::new());
        session.branch_on_timeout(Address(0x1234));

        let mut response = [0u8; 4];
        let flow = session.execute(&Request::empty(Command::ForceTimeout), &mut response, 1).unwrap();
        assert_eq!(flow.resumed().unwrap().resume_at, Address(0x1234));
        assert_eq!(session.port().requests().len(), 1);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let mut session = new_session(Simulator::unresponsive());
        session.set_default_timeout(3);
        let mut response = [0u8; 4];

        session.branch_on_timeout(Address(0x0900));
        let flow = session.execute(&Request::new(Command::Echo, &[5, 6]), &mut response, 1).unwrap();
        assert!(flow.resumed().is_some());
        assert_eq!(session.recovery().depth(), 0);
        assert_eq!(session.timeout(), TimeoutBudget::new(3));
        assert!(session.recovery().armed(Trigger::Timeout).is_none());

        session.port_mut().set_responsive(true);
        let repeated = session.execute(&Request::new(Command::Echo, &[5, 6]), &mut response, 1).unwrap();

        let mut fresh = Session::new(Simulator::new(), *session.config());
        let mut fresh_response = [0u8; 4];
        let expected = fresh.execute(&Request::new(Command::Echo, &[5, 6]), &mut fresh_response, 1).unwrap();

        assert_eq!(repeated, expected);
        assert_eq!(response, fresh_response);
        assert_eq!(session.recovery().depth(), 0);
    }

    #[test]
    fn test_device_error_without_recovery_point_is_a_status() {
        let mut session = new_session(Simulator::new());
        let mut response = [0u8; 4];
        let flow = session.execute(&Request::empty(Command::ForceError), &mut response, 1).unwrap();
        assert_eq!(flow.completed().unwrap().status, Status::InternalError);
    }

    #[test]
    fn test_device_error_resumes_at_error_point() {
        let mut session = new_session(Simulator::new());
        session.branch_on_timeout(Address(0x1000));
        session.branch_on_error(Address(0x2000));

        let mut response = [0u8; 4];
        let flow = session.execute(&Request::empty(Command::ForceError), &mut response, 1).unwrap();
        let resumed = flow.resumed().unwrap();
        assert_eq!(resumed.resume_at, Address(0x2000));
        assert_eq!(resumed.fault, Fault::Device(Status::InternalError));

        // the orchestrator finalized: nothing stays armed
        assert!(session.recovery().armed(Trigger::Timeout).is_none());
    }

    #[test]
    fn test_error_status_wins_over_oversized_payload() {
        let mut sim = Simulator::new();
        sim.on(Command::HttpGet, |_| Behaviour::respond(Status::ServerError, b"404 not found".to_vec()));
        let mut session = new_session(sim);

        let mut response = [0u8; 4];
        let flow = session
            .execute(&Request::new(Command::HttpGet, b"http://nowhere/"), &mut response, 1)
            .unwrap();
        assert_eq!(flow.completed(), Some(Reply { status: Status::ServerError, length: 13 }));
        assert_eq!(response, [0; 4]);

        // the payload was drained
        let flow = session.execute(&Request::new(Command::Echo, &[6]), &mut response, 1).unwrap();
        assert_eq!(flow.completed().unwrap().status, Status::Success);
        assert_eq!(response[0], 6);
    }

    #[test]
    fn test_pointer_set_after_header_offsets_payload() {
        let mut session = new_session(Simulator::new());
        let mut response = [0u8; 4];
        session
            .run(|s| {
                s.set_pointer(3);
                s.send_header(&Request::new(Command::Echo, &[1, 2]))?;
                assert_eq!(s.cursor().pointer(), 0);
                s.prepare_transfer_of_remaining_bytes();
                s.send(&[1, 2])?;
                s.update_transfer_size_after_transfer();

                s.receive_header()?;
                s.set_pointer(2);
                s.prepare_transfer_of_remaining_bytes();
                s.receive(&mut response)?;
                Ok(s.update_transfer_size_after_transfer())
            })
            .unwrap();
        assert_eq!(response, [0, 0, 1, 2]);
    }

    #[test]
    fn test_discard_sink_reads_but_does_not_store() {
        let mut session = new_session(Simulator::new());
        session.install_sink(Sink::discard());

        let mut response = [0u8; 2];
        let flow = session
            .execute(&Request::new(Command::Echo, &[7; 10]), &mut response, 1)
            .unwrap();
        assert_eq!(flow.completed().unwrap().length, 10);
        assert_eq!(response, [0, 0]);
        // finalize reset the strategy
        session.execute(&Request::new(Command::Echo, &[7, 8]), &mut response, 1).unwrap();
        assert_eq!(response, [7, 8]);
    }

    #[test]
    fn test_response_too_large_drains_peripheral() {
        let mut session = new_session(Simulator::new());
        let mut response = [0u8; 2];
        let err = session
            .execute(&Request::new(Command::Echo, &[1, 2, 3]), &mut response, 1)
            .unwrap_err();
        assert!(matches!(err, Error::ResponseTooLarge { declared: 3, capacity: 2 }));

        let flow = session.execute(&Request::new(Command::Echo, &[4, 5]), &mut response, 1).unwrap();
        assert_eq!(flow.completed().unwrap().status, Status::Success);
        assert_eq!(response, [4, 5]);
    }

    #[test]
    fn test_interrupt_mask_restored_on_timeout() {
        let mut sim = Simulator::unresponsive();
        sim.set_interrupt_mask(false).unwrap();
        let mut session = new_session(sim);
        let mut response = [0u8; 1];
        session.execute(&Request::empty(Command::GetIp), &mut response, 1).unwrap_err();
        assert_eq!(session.port().mask_history(), &[false, true, false]);
        assert!(!session.port().interrupts_masked());
    }

    #[test]
    fn test_interrupt_mask_restored_after_success() {
        let mut session = new_session(Simulator::new());
        let mut response = [0u8; 2];
        session.execute(&Request::new(Command::Echo, &[1, 2]), &mut response, 1).unwrap();

        let history = session.port().mask_history();
        assert!(!history.is_empty());
        assert!(history.chunks(2).all(|pair| pair == [true, false]), "{:?}", history);
        assert!(!session.port().interrupts_masked());
    }

    /// Simulator whose interrupt-mask restore fails
    struct StuckMask(Simulator);

    impl Port for StuckMask {
        fn signal_asserted(&mut self) -> std::io::Result<bool> {
            self.0.signal_asserted()
        }

        fn read_byte(&mut self) -> std::io::Result<u8> {
            self.0.read_byte()
        }

        fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
            self.0.write_byte(byte)
        }

        fn set_interrupt_mask(&mut self, masked: bool) -> std::io::Result<bool> {
            if !masked {
                return Err(std::io::Error::other("mask restore failed"));
            }
            self.0.set_interrupt_mask(masked)
        }
    }

    #[test]
    fn test_failed_mask_restore_still_fires_recovery_point() {
        let mut session = Session::new(StuckMask(Simulator::unresponsive()), Config::default());
        session.branch_on_timeout(Address(0x5000));
        let mut response = [0u8; 1];
        let flow = session.execute(&Request::empty(Command::GetIp), &mut response, 1).unwrap();
        assert_eq!(flow.resumed().unwrap().resume_at, Address(0x5000));
    }

    #[test]
    fn test_failed_mask_restore_after_success_is_an_error() {
        let mut session = Session::new(StuckMask(Simulator::new()), Config::default());
        let mut response = [0u8; 1];
        let err = session.execute(&Request::new(Command::Echo, &[1]), &mut response, 1).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_interrupts_untouched_when_masking_disabled() {
        let mut session = new_session(Simulator::new());
        session.set_mask_interrupts(false);
        let mut response = [0u8; 1];
        session.execute(&Request::new(Command::Echo, &[1]), &mut response, 1).unwrap();
        assert!(session.port().mask_history().is_empty());
    }

    #[test]
    fn test_low_level_resumable_exchange() {
        let mut session = new_session(Simulator::new());
        let payload: Vec<u8> = (0..100u8).collect();
        let mut response = vec![0u8; 100];

        let flow = session
            .run(|s| {
                s.send_header(&Request::new(Command::Echo, &payload))?;
                s.set_transfer_size(30);
                s.send(&payload)?;
                s.update_transfer_size_after_transfer();
                s.prepare_transfer_of_remaining_bytes();
                s.send(&payload)?;
                assert_eq!(s.update_transfer_size_after_transfer(), 0);

                let header = s.receive_header()?;
                s.set_transfer_size(1);
                s.receive(&mut response)?;
                s.update_transfer_size_after_transfer();
                s.prepare_transfer_of_remaining_bytes();
                s.receive(&mut response)?;
                s.update_transfer_size_after_transfer();
                Ok(header)
            })
            .unwrap();

        assert_eq!(flow.completed().unwrap().length, 100);
        assert_eq!(response, payload);
    }

    #[test]
    fn test_run_resumes_low_level_timeout() {
        let mut session = new_session(Simulator::new());
        session.branch_on_timeout(Address(0xc000));

        let flow = session
            .run(|s| -> Result<()> {
                s.send_header(&Request::empty(Command::ForceTimeout))?;
                s.receive_header()?;
                panic!("receive_header must not return after a timeout");
            })
            .unwrap();
        assert_eq!(flow.resumed().unwrap().resume_at, Address(0xc000));
        assert_eq!(session.recovery().depth(), 0);
    }

    #[test]
    fn test_run_resumes_fault_inside_nested_execute() {
        let mut session = new_session(Simulator::unresponsive());
        let mut response = [0u8; 1];
        let mut steps = 0;
        let flow = session
            .run(|s| -> Result<Flow<Reply>> {
                s.branch_on_timeout(Address(0x0c00));
                s.execute(&Request::empty(Command::GetIp), &mut response, 1)?;
                steps += 1;
                s.execute(&Request::empty(Command::GetIp), &mut response, 1)
            })
            .unwrap();

        assert_eq!(flow.resumed().unwrap().resume_at, Address(0x0c00));
        assert_eq!(steps, 0);
        assert_eq!(session.phase(), Phase::Recovered);
        assert_eq!(session.recovery().depth(), 0);

        // outside run the orchestrator is its own dispatcher again
        session.branch_on_timeout(Address(0x0d00));
        let flow = session.execute(&Request::empty(Command::GetIp), &mut response, 1).unwrap();
        assert_eq!(flow.resumed().unwrap().resume_at, Address(0x0d00));
    }

    #[test]
    fn test_run_resumes_fault_inside_nested_load() {
        let mut session = new_session(Simulator::unresponsive());
        session.branch_on_timeout(Address(0x0e00));
        let mut launcher = Recorder(None);
        let flow = session
            .run(|s| s.load_and_run(&Request::new(Command::HttpGet, b"x"), 1, &mut Memory::new(), &mut launcher))
            .unwrap();
        assert_eq!(flow.resumed().unwrap().resume_at, Address(0x0e00));
        assert!(launcher.0.is_none());
    }

    #[test]
    fn test_detect() {
        let mut session = new_session(Simulator::new());
        session.branch_on_timeout(Address(0x0801));
        assert!(session.detect());
        assert_eq!(session.recovery().armed(Trigger::Timeout).unwrap().resume_at, Address(0x0801));

        let mut session = new_session(Simulator::unresponsive());
        session.branch_on_timeout(Address(0x0801));
        assert!(!session.detect());
        assert!(session.recovery().armed(Trigger::Timeout).is_some());
        assert_eq!(session.recovery().depth(), 0);
    }

    #[test]
    fn test_detect_sends_header_only() {
        let port = MockPort::new(vec![0x00, 0x00, 0x00], vec![0xfe, 0x00, 0x00]);
        let mut session = Session::new(port, Config::default());
        assert!(session.detect());
    }

    #[test]
    fn test_load_and_run() {
        let mut sim = Simulator::new();
        let mut image = vec![0x00, 0xc0];
        image.extend([0xa9, 0x01, 0x60]);
        sim.serve("http://example.org/demo.prg", image);

        let mut session = new_session(sim);
        let mut memory = Memory::new();
        let mut launcher = Recorder(None);
        let url = b"http://example.org/demo.prg";
        let flow = session
            .load_and_run(&Request::new(Command::HttpGet, url), 2, &mut memory, &mut launcher)
            .unwrap();

        let program = flow.completed().unwrap();
        assert_eq!(program, Program { load_address: 0xc000, length: 3 });
        assert_eq!(program.entry(), Entry::Machine(0xc000));
        assert_eq!(&memory.as_slice()[0xc000..0xc003], &[0xa9, 0x01, 0x60]);
        assert_eq!(launcher.0, Some((program, vec![0xa9, 0x01, 0x60])));
    }

    #[test]
    fn test_load_and_run_timeout_matches_execute() {
        let mut session = new_session(Simulator::unresponsive());
        session.branch_on_timeout(Address(0xfce2));
        let mut launcher = Recorder(None);
        let flow = session
            .load_and_run(&Request::new(Command::HttpGet, b"x"), 1, &mut Memory::new(), &mut launcher)
            .unwrap();
        assert_eq!(flow.resumed().unwrap().resume_at, Address(0xfce2));
        assert!(launcher.0.is_none());

        let err = session
            .load_and_run(&Request::new(Command::HttpGet, b"x"), 1, &mut Memory::new(), &mut launcher)
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_load_and_run_device_error() {
        let mut session = new_session(Simulator::new());
        let mut launcher = Recorder(None);
        let err = session
            .load_and_run(&Request::new(Command::HttpGet, b"http://nowhere/"), 1, &mut Memory::new(), &mut launcher)
            .unwrap_err();
        assert!(matches!(err, Error::Device(Status::ServerError)));

        // the peripheral is back in sync
        let mut response = [0u8; 1];
        let flow = session.execute(&Request::new(Command::Echo, &[3]), &mut response, 1).unwrap();
        assert_eq!(flow.completed().unwrap().status, Status::Success);
    }

    #[test]
    fn test_custom_handler_and_indexed_sink() {
        let mut sim = Simulator::new();
        sim.on(Command::GetMac, |_| Behaviour::respond(Status::Success, b"aa:bb".to_vec()));
        let mut session = new_session(sim);
        session.install_sink(Sink::custom(Indexed::new(3)));

        let mut response = [0u8; 8];
        session.execute(&Request::empty(Command::GetMac), &mut response, 1).unwrap();
        assert_eq!(&response, b"\0\0\0aa:bb");
    }
}
