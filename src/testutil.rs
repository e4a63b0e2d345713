//! Host-runnable fakes for the traits `hal` names (spec.md's §2 "test
//! tooling": every core module's tests run against an in-memory fake
//! `BlockDevice`, never a real driver).
use std::sync::Mutex;
use std::vec::Vec;

use crate::hal::{BlockDevice, Console};
use crate::param::BLOCK_SIZE;

/// An in-memory disk of `num_blocks` zeroed blocks.
pub struct FakeDisk {
    blocks: Mutex<Vec<[u8; BLOCK_SIZE]>>,
}

impl FakeDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(std::vec![[0u8; BLOCK_SIZE]; num_blocks]),
        }
    }
}

impl BlockDevice for FakeDisk {
    fn read(&self, block_no: u32, buf: &mut [u8; BLOCK_SIZE]) {
        let blocks = self.blocks.lock().unwrap();
        buf.copy_from_slice(&blocks[block_no as usize]);
    }

    fn write(&self, block_no: u32, buf: &[u8; BLOCK_SIZE]) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[block_no as usize].copy_from_slice(buf);
    }
}

/// Collects emitted bytes instead of driving a UART, so tests can
/// assert on kernel log output.
#[derive(Default)]
pub struct FakeConsole {
    pub out: Mutex<Vec<u8>>,
}

impl FakeConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> std::string::String {
        std::string::String::from_utf8_lossy(&self.out.lock().unwrap()).into_owned()
    }
}

impl Console for FakeConsole {
    fn put_byte(&self, b: u8) {
        self.out.lock().unwrap().push(b);
    }
}
