//! Data input trait and implementation for the wire format.

use crate::error::{Error, Result};
use bytes::Buf;
use std::io::Cursor;

/// Trait for reading primitive values from the Aerospike binary format.
///
/// All multi-byte values are read in big-endian byte order.
pub trait DataInput {
    /// Reads a single unsigned byte.
    fn read_u8(&mut self) -> Result<u8>;

    /// Reads a 16-bit unsigned integer.
    fn read_u16(&mut self) -> Result<u16>;

    /// Reads a 32-bit unsigned integer.
    fn read_u32(&mut self) -> Result<u32>;

    /// Reads a 64-bit unsigned integer.
    fn read_u64(&mut self) -> Result<u64>;

    /// Reads the specified number of raw bytes.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Skips the specified number of bytes.
    fn skip(&mut self, len: usize) -> Result<()>;

    /// Reads an 8-bit signed integer.
    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Reads a 16-bit signed integer.
    fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    /// Reads a 32-bit signed integer.
    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Reads a 64-bit signed integer.
    fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Reads a 64-bit floating point.
    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }
}

/// A slice-based implementation of `DataInput`.
#[derive(Debug)]
pub struct BufferReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BufferReader<'a> {
    /// Creates a new reader over the given byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    /// Returns the number of bytes remaining to be read.
    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    /// Returns the current position in the buffer.
    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    /// Borrows the next `len` bytes without copying and advances past them.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure_remaining(len)?;
        let start = self.position();
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    /// Peeks at the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        self.ensure_remaining(1)?;
        Ok(self.cursor.get_ref()[self.position()])
    }

    fn ensure_remaining(&self, n: usize) -> Result<()> {
        if self.cursor.remaining() < n {
            Err(Error::Serialization(format!(
                "insufficient data: need {} bytes, have {}",
                n,
                self.cursor.remaining()
            )))
        } else {
            Ok(())
        }
    }
}

impl DataInput for BufferReader<'_> {
    fn read_u8(&mut self) -> Result<u8> {
        self.ensure_remaining(1)?;
        Ok(self.cursor.get_u8())
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.ensure_remaining(2)?;
        Ok(self.cursor.get_u16())
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.ensure_remaining(4)?;
        Ok(self.cursor.get_u32())
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.ensure_remaining(8)?;
        Ok(self.cursor.get_u64())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.read_slice(len)?.to_vec())
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.read_slice(len).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_integers() {
        let data = [0, 1, 0, 0, 0, 2, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE];
        let mut input = BufferReader::new(&data);
        assert_eq!(input.read_u16().unwrap(), 1);
        assert_eq!(input.read_u32().unwrap(), 2);
        assert_eq!(input.read_i64().unwrap(), -2);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_fails() {
        let data = [1, 2, 3];
        let mut input = BufferReader::new(&data);
        let err = input.read_u32().unwrap_err();
        assert!(err.to_string().contains("need 4 bytes, have 3"));
        assert_eq!(input.position(), 0);
    }

    #[test]
    fn test_read_slice_borrows() {
        let data = b"hello world";
        let mut input = BufferReader::new(data);
        assert_eq!(input.read_slice(5).unwrap(), b"hello");
        input.skip(1).unwrap();
        assert_eq!(input.peek_u8().unwrap(), b'w');
        assert_eq!(input.read_bytes(5).unwrap(), b"world".to_vec());
    }
}
