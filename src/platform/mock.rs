//! Host-only mock implementations of the platform traits, used by the
//! test suite so it runs under plain `cargo test` with no real files,
//! sockets, or peripherals.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;

use super::traits::{MemorySpace, Platform};

/// An in-process byte buffer implementing `MemorySpace`.
pub struct MockSpace {
    bytes: Vec<u8>,
}

impl MockSpace {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0u8; size],
        }
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl MemorySpace for MockSpace {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read_word(&self, offset: usize) -> isize {
        let width = size_of::<isize>();
        let mut buf = [0u8; size_of::<isize>()];
        buf.copy_from_slice(&self.bytes[offset..offset + width]);
        isize::from_ne_bytes(buf)
    }

    fn write_word(&mut self, offset: usize, value: isize) {
        let width = size_of::<isize>();
        self.bytes[offset..offset + width].copy_from_slice(&value.to_ne_bytes());
    }

    fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }

    fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.bytes[offset..offset + len]
    }
}

/// A console `Platform` that captures output and replays canned input,
/// for assertions in tests.
#[derive(Default)]
pub struct MockConsole {
    pub output: Vec<u8>,
    pub input_lines: Vec<String>,
    tick: u64,
}

impl MockConsole {
    #[must_use]
    pub fn with_input(lines: &[&str]) -> Self {
        Self {
            output: Vec::new(),
            input_lines: lines.iter().rev().map(|s| (*s).into()).collect(),
            tick: 0,
        }
    }

    #[must_use]
    pub fn output_as_str(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl Platform for MockConsole {
    fn print_line(&mut self, line: &str) {
        self.output.extend_from_slice(line.as_bytes());
        self.output.push(b'\n');
    }

    fn write(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    fn read_line(&mut self) -> Option<String> {
        self.input_lines.pop()
    }

    fn ticks(&self) -> u64 {
        self.tick
    }
}

#[cfg(test)]
#[path = "mock_test.rs"]
mod mock_test;
