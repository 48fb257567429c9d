//! Data output trait and implementations for the wire format.

use crate::error::Result;
use bytes::{BufMut, BytesMut};

/// Trait for writing primitive values in the Aerospike binary format.
///
/// All multi-byte values are written in big-endian byte order unless the
/// method name says otherwise.
pub trait DataOutput {
    /// Writes a single unsigned byte.
    fn write_u8(&mut self, v: u8) -> Result<()>;

    /// Writes a 16-bit unsigned integer in big-endian order.
    fn write_u16(&mut self, v: u16) -> Result<()>;

    /// Writes a 16-bit unsigned integer in little-endian order.
    fn write_u16_le(&mut self, v: u16) -> Result<()>;

    /// Writes a 32-bit unsigned integer in big-endian order.
    fn write_u32(&mut self, v: u32) -> Result<()>;

    /// Writes a 64-bit unsigned integer in big-endian order.
    fn write_u64(&mut self, v: u64) -> Result<()>;

    /// Writes raw bytes without length prefix.
    fn write_bytes(&mut self, v: &[u8]) -> Result<()>;

    /// Writes an 8-bit signed integer.
    fn write_i8(&mut self, v: i8) -> Result<()> {
        self.write_u8(v as u8)
    }

    /// Writes a 16-bit signed integer in big-endian order.
    fn write_i16(&mut self, v: i16) -> Result<()> {
        self.write_u16(v as u16)
    }

    /// Writes a 32-bit signed integer in big-endian order.
    fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_u32(v as u32)
    }

    /// Writes a 64-bit signed integer in big-endian order.
    fn write_i64(&mut self, v: i64) -> Result<()> {
        self.write_u64(v as u64)
    }

    /// Writes a 64-bit floating point in big-endian order.
    fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_u64(v.to_bits())
    }
}

impl DataOutput for BytesMut {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put_u8(v);
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.put_u16(v);
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.put_u16_le(v);
        Ok(())
    }

    fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put_u32(v);
        Ok(())
    }

    fn write_u64(&mut self, v: u64) -> Result<()> {
        self.put_u64(v);
        Ok(())
    }

    fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.put_slice(v);
        Ok(())
    }
}

/// A `DataOutput` that only counts bytes.
///
/// Packing into a counter gives the exact encoded size without allocating,
/// which is how request buffers are sized before being written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SizeCounter {
    count: usize,
}

impl SizeCounter {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bytes written so far.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl DataOutput for SizeCounter {
    fn write_u8(&mut self, _v: u8) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn write_u16(&mut self, _v: u16) -> Result<()> {
        self.count += 2;
        Ok(())
    }

    fn write_u16_le(&mut self, _v: u16) -> Result<()> {
        self.count += 2;
        Ok(())
    }

    fn write_u32(&mut self, _v: u32) -> Result<()> {
        self.count += 4;
        Ok(())
    }

    fn write_u64(&mut self, _v: u64) -> Result<()> {
        self.count += 8;
        Ok(())
    }

    fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.count += v.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_integers() {
        let mut out = BytesMut::new();
        out.write_i16(0x0102).unwrap();
        out.write_i32(0x0304_0506).unwrap();
        out.write_i64(42).unwrap();
        assert_eq!(
            &out[..],
            &[1, 2, 3, 4, 5, 6, 0, 0, 0, 0, 0, 0, 0, 42]
        );
    }

    #[test]
    fn test_little_endian_u16() {
        let mut out = BytesMut::new();
        out.write_u16_le(0x0FFF).unwrap();
        assert_eq!(&out[..], &[0xFF, 0x0F]);
    }

    #[test]
    fn test_f64_bits() {
        let mut out = BytesMut::new();
        out.write_f64(1.5).unwrap();
        assert_eq!(&out[..], &1.5f64.to_be_bytes());
    }

    #[test]
    fn test_size_counter_matches_buffer() {
        let mut out = BytesMut::new();
        let mut counter = SizeCounter::new();
        for sink in [&mut out as &mut dyn DataOutput, &mut counter] {
            sink.write_u8(1).unwrap();
            sink.write_u16(2).unwrap();
            sink.write_u32(3).unwrap();
            sink.write_f64(4.0).unwrap();
            sink.write_bytes(b"abc").unwrap();
        }
        assert_eq!(counter.count(), out.len());
        assert_eq!(counter.count(), 18);
    }
}
