//! Fixed-capacity byte buffer with bit-granular cursor I/O
//!
//! The wire format packs sub-byte fields (a 6-bit version, a 3-bit packet
//! type, 11/12-bit lengths) with no alignment padding, so reads and writes
//! go through a bit cursor. Bytes fill MSB-first and multi-bit values are
//! big-endian within the bit stream.

use crate::{Error, Result};

/// Owned byte region with a fixed capacity chosen at construction.
///
/// Cursor views ([`BufferWriter`], [`BufferReader`]) borrow the bytes and
/// keep their own position.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Box<[u8]>,
}

impl Buffer {
    /// Create a zero-filled buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// Create a buffer holding a copy of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer has zero capacity
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// View the underlying bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the underlying bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Start a bit-cursor writer at the beginning of the buffer
    pub fn writer(&mut self) -> BufferWriter<'_> {
        BufferWriter::new(&mut self.data)
    }

    /// Start a bit-cursor reader at the beginning of the buffer
    pub fn reader(&self) -> BufferReader<'_> {
        BufferReader::new(&self.data)
    }
}

/// Bit-cursor writer over a byte slice
#[derive(Debug)]
pub struct BufferWriter<'a> {
    data: &'a mut [u8],
    /// Cursor position in bits
    cursor: usize,
}

impl<'a> BufferWriter<'a> {
    /// Create a writer positioned at the start of `data`
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    /// Rewind the cursor to the start
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Write the low `bits` bits of `value`, most significant bit first
    pub fn write_bits(&mut self, value: u64, bits: usize) -> Result<()> {
        if bits > 64 || self.cursor + bits > self.data.len() * 8 {
            return Err(Error::BufferOverflow);
        }

        for i in (0..bits).rev() {
            let bit = ((value >> i) & 1) as u8;
            let byte = self.cursor / 8;
            let shift = 7 - (self.cursor % 8);
            self.data[byte] = (self.data[byte] & !(1 << shift)) | (bit << shift);
            self.cursor += 1;
        }

        Ok(())
    }

    /// Write `src` at the current cursor, shifting into place if the cursor
    /// is mid-byte
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        if self.cursor + src.len() * 8 > self.data.len() * 8 {
            return Err(Error::BufferOverflow);
        }

        if self.cursor % 8 == 0 {
            let start = self.cursor / 8;
            self.data[start..start + src.len()].copy_from_slice(src);
            self.cursor += src.len() * 8;
            return Ok(());
        }

        for &byte in src {
            self.write_bits(byte as u64, 8)?;
        }

        Ok(())
    }

    /// Bytes touched so far, counting a trailing partial byte as written
    pub fn bytes_written(&self) -> usize {
        self.cursor.div_ceil(8)
    }

    /// Whole bytes still available past the cursor
    pub fn remaining_bytes(&self) -> usize {
        self.data.len() - self.bytes_written()
    }
}

/// Bit-cursor reader over a byte slice
#[derive(Debug)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    /// Cursor position in bits
    cursor: usize,
}

impl<'a> BufferReader<'a> {
    /// Create a reader positioned at the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    /// Rewind the cursor to the start
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Read `bits` bits as a big-endian value
    pub fn read_bits(&mut self, bits: usize) -> Result<u64> {
        if bits > 64 || self.cursor + bits > self.data.len() * 8 {
            return Err(Error::BufferExhausted);
        }

        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.cursor / 8;
            let shift = 7 - (self.cursor % 8);
            value = (value << 1) | ((self.data[byte] >> shift) & 1) as u64;
            self.cursor += 1;
        }

        Ok(value)
    }

    /// Fill `dst` from the current cursor, shifting if the cursor is mid-byte
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.cursor + dst.len() * 8 > self.data.len() * 8 {
            return Err(Error::BufferExhausted);
        }

        if self.cursor % 8 == 0 {
            let start = self.cursor / 8;
            dst.copy_from_slice(&self.data[start..start + dst.len()]);
            self.cursor += dst.len() * 8;
            return Ok(());
        }

        for byte in dst.iter_mut() {
            *byte = self.read_bits(8)? as u8;
        }

        Ok(())
    }

    /// Byte index of the cursor, rounded down
    pub fn byte_position(&self) -> usize {
        self.cursor / 8
    }

    /// Whole bytes readable past the cursor.
    ///
    /// Sub-byte slack at the end of the stream does not count: a reader
    /// sitting 4 bits into the last byte has zero remaining bytes.
    pub fn remaining_bytes(&self) -> usize {
        (self.data.len() * 8 - self.cursor) / 8
    }
}
