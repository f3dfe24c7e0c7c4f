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

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use wic64::sim::Simulator;
use wic64::{
    Command, Config, Flow, HandshakeLine, Memory, Port, PrgWriter, Request, SerialBridge, Session, Status,
    TimeoutBudget,
};

/// Largest payload a 16-bit length field can declare
const RESPONSE_CAPACITY: usize = u16::MAX as usize;

#[derive(Parser)]
#[command(name = "wic64")]
#[command(about = "Talk to a WiC64 network adapter over a userport bridge", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port of the userport bridge (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long, required_unless_present = "simulate", conflicts_with = "simulate")]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Modem status line wired to the handshake signal
    #[arg(long, value_enum, default_value = "cts")]
    line: Line,

    /// Use the built-in simulated peripheral instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Timeout magnitude (1-255) for the command
    #[arg(short, long, default_value = "2", value_name = "T")]
    timeout: u8,

    /// Leave host interrupts alone during transfers
    #[arg(long)]
    no_mask_irqs: bool,

    /// Pause between handshake polls in microseconds
    #[arg(long, default_value = "50", value_name = "US")]
    poll_interval: u64,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Line {
    Cts,
    Dsr,
    Dcd,
    Ri,
}

impl From<Line> for HandshakeLine {
    fn from(line: Line) -> Self {
        match line {
            Line::Cts => HandshakeLine::Cts,
            Line::Dsr => HandshakeLine::Dsr,
            Line::Dcd => HandshakeLine::CarrierDetect,
            Line::Ri => HandshakeLine::RingIndicator,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a peripheral answers
    Detect,
    /// Print the firmware version
    Version,
    /// Send text and print what comes back
    Echo { text: String },
    /// Fetch a URL and print the body
    Get {
        url: String,
        /// Write the body to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the message for the last status
    StatusMessage,
    /// Print the peripheral's IP address
    Ip,
    /// Fetch a program image and store it as a PRG file
    Load { url: String, out: PathBuf },
    /// Send an arbitrary opcode with a hex payload
    Raw {
        /// Opcode in hex (e.g., fe or 0x2a)
        opcode: String,
        /// Payload bytes in hex (e.g., "01 02 ff" or 0102ff)
        payload: Option<String>,
    },
}

fn parse_opcode(text: &str) -> Result<u8, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|_| format!("Invalid opcode: {}. Must be a hex byte", text))
}

fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(format!("Invalid payload: {}. Needs an even number of hex digits", text));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| format!("Invalid payload: {}", text)))
        .collect()
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("wic64=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wic64=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn open_port(cli: &Cli) -> anyhow::Result<Box<dyn Port>> {
    if cli.simulate {
        return Ok(Box::new(Simulator::new()));
    }
    let name = cli.port.as_deref().context("no serial port given")?;
    let bridge = SerialBridge::open(name, cli.baud, cli.line.into())
        .with_context(|| format!("failed to open serial port {}", name))?;
    Ok(Box::new(bridge))
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let port = open_port(&cli)?;
    let timeout = TimeoutBudget::from(cli.timeout);
    let config = Config {
        timeout,
        mask_interrupts: !cli.no_mask_irqs,
        poll_interval: Duration::from_micros(cli.poll_interval),
    };
    let mut session = Session::new(port, config);

    match cli.command {
        Commands::Detect => {
            if !session.detect() {
                bail!("no WiC64 answered");
            }
            println!("WiC64 detected");
        }
        Commands::Version => {
            let version = query(&mut session, &Request::empty(Command::GetVersionString), timeout)?;
            println!("{}", text(&version));
        }
        Commands::Echo { text: message } => {
            let echoed = query(&mut session, &Request::new(Command::Echo, message.as_bytes()), timeout)?;
            println!("{}", text(&echoed));
        }
        Commands::Get { url, output } => {
            let body = query(&mut session, &Request::new(Command::HttpGet, url.as_bytes()), timeout)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &body).with_context(|| format!("failed to write {}", path.display()))?;
                    println!("{} bytes written to {}", body.len(), path.display());
                }
                None => println!("{}", text(&body)),
            }
        }
        Commands::StatusMessage => println!("{}", status_message(&mut session, timeout)?),
        Commands::Ip => {
            let ip = query(&mut session, &Request::empty(Command::GetIp), timeout)?;
            println!("{}", text(&ip));
        }
        Commands::Load { url, out } => {
            let mut memory = Memory::new();
            let mut writer = PrgWriter::new(&out);
            let request = Request::new(Command::HttpGet, url.as_bytes());
            let flow = match session.load_and_run(&request, timeout, &mut memory, &mut writer) {
                Err(wic64::Error::Device(status)) => {
                    bail!("{} ({})", status, status_message(&mut session, timeout)?)
                }
                other => other?,
            };
            match flow {
                Flow::Completed(program) => {
                    println!("{} bytes at {} saved to {}", program.length, wic64::Address(program.load_address), out.display())
                }
                Flow::Resumed(resumed) => bail!("transfer abandoned: {}", resumed.fault),
            }
        }
        Commands::Raw { opcode, payload } => {
            let opcode = parse_opcode(&opcode).map_err(anyhow::Error::msg)?;
            let payload = match payload {
                Some(hex) => parse_hex(&hex).map_err(anyhow::Error::msg)?,
                None => Vec::new(),
            };
            let mut response = vec![0u8; RESPONSE_CAPACITY];
            match session.execute(&Request::new(opcode, &payload), &mut response, timeout)? {
                Flow::Completed(reply) => {
                    println!("status: {}", reply.status);
                    if !reply.status.is_success() {
                        return Ok(());
                    }
                    for chunk in response[..usize::from(reply.length)].chunks(16) {
                        let line: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                        println!("{}", line.join(" "));
                    }
                }
                Flow::Resumed(resumed) => bail!("transfer abandoned: {}", resumed.fault),
            }
        }
    }
    Ok(())
}

/// Execute `request` and return the payload, turning an error status into
/// an error that carries the peripheral's own message.
fn query<P: Port>(session: &mut Session<P>, request: &Request<'_>, timeout: TimeoutBudget) -> anyhow::Result<Vec<u8>> {
    let mut response = vec![0u8; RESPONSE_CAPACITY];
    match session.execute(request, &mut response, timeout)? {
        Flow::Completed(reply) if reply.status.is_success() => {
            response.truncate(usize::from(reply.length));
            Ok(response)
        }
        Flow::Completed(reply) => bail!("{} ({})", reply.status, status_message(session, timeout)?),
        Flow::Resumed(resumed) => bail!("transfer abandoned: {}", resumed.fault),
    }
}

fn status_message<P: Port>(session: &mut Session<P>, timeout: TimeoutBudget) -> anyhow::Result<String> {
    let mut response = vec![0u8; RESPONSE_CAPACITY];
    match session.execute(&Request::empty(Command::GetStatusMessage), &mut response, timeout)? {
        Flow::Completed(reply) if reply.status == Status::Success => Ok(text(&response[..usize::from(reply.length)])),
        Flow::Completed(reply) => bail!("status message unavailable: {}", reply.status),
        Flow::Resumed(resumed) => bail!("transfer abandoned: {}", resumed.fault),
    }
}

/// Firmware strings may be NUL terminated
fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opcode() {
        assert_eq!(parse_opcode("fe"), Ok(0xfe));
        assert_eq!(parse_opcode("0x2A"), Ok(0x2a));
        assert!(parse_opcode("100").is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("01 02 ff"), Ok(vec![1, 2, 0xff]));
        assert_eq!(parse_hex("0102ff"), Ok(vec![1, 2, 0xff]));
        assert_eq!(parse_hex(""), Ok(vec![]));
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["wic64", "--simulate", "raw", "fe", "0102"]).unwrap();
        assert!(cli.simulate);
        assert!(matches!(cli.command, Commands::Raw { .. }));
        assert!(Cli::try_parse_from(["wic64", "ip"]).is_err());
    }

    #[test]
    fn test_query_against_simulator() {
        let mut session = Session::new(Simulator::new(), Config::default());
        let ip = query(&mut session, &Request::empty(Command::GetIp), TimeoutBudget::MIN).unwrap();
        assert_eq!(text(&ip), "192.168.0.64");

        let err = query(&mut session, &Request::empty(Command::ForceError), TimeoutBudget::MIN).unwrap_err();
        assert!(err.to_string().contains("forced error"));
    }
}
