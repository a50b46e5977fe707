//! Tap ring buffer access
//!
//! The worker owns the write cursor and advances it modulo capacity after
//! copying a frame in. Each reader keeps a private cursor and never blocks:
//! a read returns whatever lies between its cursor and the write cursor.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::control::ControlBlock;

/// Chunk size used when draining everything available
const DRAIN_CHUNK: usize = 4096;

/// Cursor-tracking reader over a block's tap ring
pub struct TapReader {
    block: Arc<ControlBlock>,
    cursor: usize,
}

impl TapReader {
    /// Start reading at the block's current write cursor
    pub fn new(block: Arc<ControlBlock>) -> Self {
        let cursor = block.tap_write_cursor();
        Self { block, cursor }
    }

    /// Bytes that a read would currently return
    pub fn available(&self) -> usize {
        let capacity = self.block.tap_capacity();
        if capacity == 0 {
            return 0;
        }
        let write = self.block.tap_write_cursor();
        (write + capacity - self.cursor) % capacity
    }

    /// Copy available bytes into `buf`, returning how many were copied
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let capacity = self.block.tap_capacity();
        if capacity == 0 {
            return 0;
        }

        let mut copied = 0;
        while copied < buf.len() {
            let write = self.block.tap_write_cursor() % capacity;
            if write == self.cursor {
                break;
            }
            let contiguous = if self.cursor < write {
                write - self.cursor
            } else {
                capacity - self.cursor
            };
            let n = contiguous.min(buf.len() - copied);
            self.block.read_tap(self.cursor, &mut buf[copied..copied + n]);
            self.cursor = (self.cursor + n) % capacity;
            copied += n;
        }
        copied
    }

    /// Drain everything available into one buffer
    pub fn read_available(&mut self) -> Option<Bytes> {
        let mut out = BytesMut::new();
        let mut chunk = [0u8; DRAIN_CHUNK];
        loop {
            let n = self.read(&mut chunk);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        (!out.is_empty()).then(|| out.freeze())
    }
}

/// Single-producer writer, the worker's half of the contract
pub struct TapWriter {
    block: Arc<ControlBlock>,
}

impl TapWriter {
    pub fn new(block: Arc<ControlBlock>) -> Self {
        Self { block }
    }

    /// Append `data`, wrapping at capacity, then publish the new cursor
    pub fn write(&mut self, mut data: &[u8]) {
        let capacity = self.block.tap_capacity();
        if capacity == 0 {
            return;
        }
        if data.len() > capacity {
            data = &data[data.len() - capacity..];
        }

        let mut cursor = self.block.tap_write_cursor() % capacity;
        while !data.is_empty() {
            let n = (capacity - cursor).min(data.len());
            self.block.write_tap(cursor, &data[..n]);
            cursor = (cursor + n) % capacity;
            data = &data[n..];
        }
        self.block.publish_tap_cursor(cursor);
    }
}
