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

use std::fmt;

use crate::error::{Error, Result};

/// Size of a request header: command, length low byte, length high byte
pub const REQUEST_HEADER_LEN: usize = 3;

/// Size of a response header: status, length low byte, length high byte
pub const RESPONSE_HEADER_LEN: usize = 3;

// ============================================================================
// Command Catalog
// ============================================================================

/// Opcodes understood by the peripheral. The driver never interprets them,
/// they are only placed in the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Firmware version as a printable string
    GetVersionString = 0x00,
    /// HTTP GET, URL in payload
    HttpGet = 0x01,
    /// Connect to an access point by SSID and passphrase
    ConnectWithSsidString = 0x02,
    /// Local IP address
    GetIp = 0x06,
    /// Set the default server endpoint
    SetServer = 0x08,
    /// Scan for wireless networks
    ScanWifiNetworks = 0x0c,
    /// Connect to a network from the last scan by index
    ConnectWithSsidIndex = 0x0d,
    /// HTTP GET, URL with encoded binary parameters
    HttpGetEncoded = 0x0f,
    /// SSID of the current network
    GetSsid = 0x10,
    /// Signal strength of the current network
    GetRssi = 0x11,
    /// Current default server endpoint
    GetServer = 0x12,
    /// MAC address
    GetMac = 0x14,
    /// Local time in the configured timezone
    GetLocalTime = 0x15,
    /// Set the timezone index
    SetTimezone = 0x16,
    /// Current timezone index
    GetTimezone = 0x17,
    /// Open a TCP connection
    TcpOpen = 0x21,
    /// Read from the open TCP connection
    TcpRead = 0x22,
    /// Write to the open TCP connection
    TcpWrite = 0x23,
    /// Firmware version as four numbers
    GetVersionNumbers = 0x26,
    /// Update the firmware from a URL
    UpdateFirmware = 0x27,
    /// Set the URL for a following HTTP POST
    HttpPostUrl = 0x28,
    /// Reboot the peripheral
    Reboot = 0x29,
    /// Human readable message for the last status code
    GetStatusMessage = 0x2a,
    /// Send body data for HTTP POST
    HttpPostData = 0x2b,
    /// Whether a network connection is established
    IsConnected = 0x2c,
    /// Configure the peripheral-side transfer timeout
    SetTimeout = 0x2d,
    /// Close the open TCP connection
    TcpClose = 0x2e,
    /// Number of bytes waiting on the open TCP connection
    TcpAvailable = 0x30,
    /// Test hook: never answer the request
    ForceTimeout = 0xfc,
    /// Test hook: answer with an error status
    ForceError = 0xfd,
    /// Diagnostic echo of the request payload
    Echo = 0xfe,
}

impl Command {
    const ALL: [Self; 31] = [
        Self::GetVersionString,
        Self::HttpGet,
        Self::ConnectWithSsidString,
        Self::GetIp,
        Self::SetServer,
        Self::ScanWifiNetworks,
        Self::ConnectWithSsidIndex,
        Self::HttpGetEncoded,
        Self::GetSsid,
        Self::GetRssi,
        Self::GetServer,
        Self::GetMac,
        Self::GetLocalTime,
        Self::SetTimezone,
        Self::GetTimezone,
        Self::TcpOpen,
        Self::TcpRead,
        Self::TcpWrite,
        Self::GetVersionNumbers,
        Self::UpdateFirmware,
        Self::HttpPostUrl,
        Self::Reboot,
        Self::GetStatusMessage,
        Self::HttpPostData,
        Self::IsConnected,
        Self::SetTimeout,
        Self::TcpClose,
        Self::TcpAvailable,
        Self::ForceTimeout,
        Self::ForceError,
        Self::Echo,
    ];

    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.opcode() == opcode)
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        command.opcode()
    }
}

// ============================================================================
// Status Codes
// ============================================================================

/// Status byte of a response header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    InternalError,
    ClientError,
    ConnectionError,
    NetworkError,
    ServerError,
    /// A status byte this driver does not know about
    Unknown(u8),
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::InternalError => 1,
            Status::ClientError => 2,
            Status::ConnectionError => 3,
            Status::NetworkError => 4,
            Status::ServerError => 5,
            Status::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        match code {
            0 => Status::Success,
            1 => Status::InternalError,
            2 => Status::ClientError,
            3 => Status::ConnectionError,
            4 => Status::NetworkError,
            5 => Status::ServerError,
            other => Status::Unknown(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::InternalError => write!(f, "internal error"),
            Status::ClientError => write!(f, "client error"),
            Status::ConnectionError => write!(f, "connection error"),
            Status::NetworkError => write!(f, "network error"),
            Status::ServerError => write!(f, "server error"),
            Status::Unknown(code) => write!(f, "unknown status 0x{:02X}", code),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// An outgoing message: opcode plus a borrowed payload. The payload buffer
/// stays owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    opcode: u8,
    payload: &'a [u8],
}

impl<'a> Request<'a> {
    pub fn new(command: impl Into<u8>, payload: &'a [u8]) -> Self {
        Request { opcode: command.into(), payload }
    }

    pub fn empty(command: impl Into<u8>) -> Self {
        Request::new(command, &[])
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Wire form of the request header.
    pub fn header(&self) -> Result<[u8; REQUEST_HEADER_LEN]> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| Error::PayloadTooLarge(self.payload.len()))?;
        let [lo, hi] = len.to_le_bytes();
        Ok([self.opcode, lo, hi])
    }
}

/// Decoded response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: Status,
    pub length: u16,
}

impl ResponseHeader {
    pub fn from_bytes(raw: [u8; RESPONSE_HEADER_LEN]) -> Self {
        ResponseHeader {
            status: Status::from(raw[0]),
            length: u16::from_le_bytes([raw[1], raw[2]]),
        }
    }

    pub fn to_bytes(self) -> [u8; RESPONSE_HEADER_LEN] {
        let [lo, hi] = self.length.to_le_bytes();
        [self.status.code(), lo, hi]
    }
}
