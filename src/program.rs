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

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use tracing::info;

use crate::error::Result;
use crate::recovery::Address;

/// Size of the host address space
pub const MEMORY_SIZE: usize = 0x10000;

/// Load address of BASIC programs
pub const BASIC_START: u16 = 0x0801;

/// The 64 KiB address space a program image is loaded into
pub struct Memory {
    bytes: Box<[u8]>,
}

impl Memory {
    pub fn new() -> Self {
        Memory { bytes: vec![0u8; MEMORY_SIZE].into_boxed_slice() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Copy `length` bytes starting at `start`, wrapping at the top of memory
    pub fn read(&self, start: u16, length: u16) -> Vec<u8> {
        (0..length).map(|i| self.bytes[usize::from(start.wrapping_add(i))]).collect()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}

/// How a loaded program is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Loaded at the BASIC start, entered with RUN
    Basic,
    /// Machine code, entered with a jump to the address
    Machine(u16),
}

/// A program image that has been placed in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Program {
    pub load_address: u16,
    pub length: u16,
}

impl Program {
    /// One past the last byte, wrapping at the top of memory
    pub fn end(&self) -> u16 {
        self.load_address.wrapping_add(self.length)
    }

    pub fn entry(&self) -> Entry {
        if self.load_address == BASIC_START {
            Entry::Basic
        } else {
            Entry::Machine(self.load_address)
        }
    }

    /// The image in PRG layout: load address, then the body
    pub fn to_prg(&self, memory: &Memory) -> Vec<u8> {
        let mut prg = self.load_address.to_le_bytes().to_vec();
        prg.extend(memory.read(self.load_address, self.length));
        prg
    }
}

/// Hands control to a freshly loaded program
pub trait Launcher {
    fn launch(&mut self, memory: &Memory, program: &Program) -> Result<()>;
}

/// Launcher that stores the image as a `.prg` file for an emulator or a
/// later transfer
pub struct PrgWriter {
    path: PathBuf,
}

impl PrgWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PrgWriter { path: path.into() }
    }
}

impl Launcher for PrgWriter {
    fn launch(&mut self, memory: &Memory, program: &Program) -> Result<()> {
        let mut file = File::create(&self.path)?;
        file.write_all(&program.to_prg(memory))?;
        info!(
            path = %self.path.display(),
            load_address = %Address(program.load_address),
            entry = ?program.entry(),
            "program image written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point() {
        let basic = Program { load_address: BASIC_START, length: 10 };
        assert_eq!(basic.entry(), Entry::Basic);
        let code = Program { load_address: 0xc000, length: 10 };
        assert_eq!(code.entry(), Entry::Machine(0xc000));
    }

    #[test]
    fn test_image_wraps_at_top_of_memory() {
        let mut memory = Memory::new();
        memory.as_mut_slice()[0xffff] = 1;
        memory.as_mut_slice()[0x0000] = 2;
        let program = Program { load_address: 0xffff, length: 2 };
        assert_eq!(program.end(), 0x0001);
        assert_eq!(program.to_prg(&memory), vec![0xff, 0xff, 1, 2]);
    }

    #[test]
    fn test_prg_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.prg");
        let mut memory = Memory::new();
        memory.as_mut_slice()[0x0801..0x0804].copy_from_slice(&[0x0b, 0x08, 0x0a]);

        let program = Program { load_address: 0x0801, length: 3 };
        PrgWriter::new(&path).launch(&memory, &program).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0x01, 0x08, 0x0b, 0x08, 0x0a]);
    }
}
