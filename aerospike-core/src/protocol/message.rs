//! The 22-byte message header carried by every data request and response.

use bytes::{Buf, BufMut, BytesMut};

use super::constants::*;
use crate::error::{Error, Result};
use crate::result_code::ResultCode;

/// Decoded message header.
///
/// In batch responses the `timeout` slot carries the batch index of the
/// record; in partition scans `generation` carries the partition id of a
/// `PARTITION_DONE` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Read attributes.
    pub info1: u8,
    /// Write attributes.
    pub info2: u8,
    /// Other attributes.
    pub info3: u8,
    /// Result code byte.
    pub result_code: u8,
    /// Record generation.
    pub generation: u32,
    /// Record expiration in seconds since the server epoch.
    pub expiration: u32,
    /// Server timeout in milliseconds, or batch index in batch replies.
    pub timeout: u32,
    /// Number of fields that follow.
    pub field_count: u16,
    /// Number of operations that follow the fields.
    pub op_count: u16,
}

impl MessageHeader {
    /// Parses a header from the next 22 bytes of `src`, advancing it.
    pub fn read_from(src: &mut impl Buf) -> Result<Self> {
        if src.remaining() < MSG_REMAINING_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "message header requires {} bytes, have {}",
                MSG_REMAINING_HEADER_SIZE,
                src.remaining()
            )));
        }

        let header_size = src.get_u8();
        if header_size as usize != MSG_REMAINING_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "invalid message header size: {}",
                header_size
            )));
        }

        let info1 = src.get_u8();
        let info2 = src.get_u8();
        let info3 = src.get_u8();
        src.advance(1);
        let result_code = src.get_u8();
        Ok(Self {
            info1,
            info2,
            info3,
            result_code,
            generation: src.get_u32(),
            expiration: src.get_u32(),
            timeout: src.get_u32(),
            field_count: src.get_u16(),
            op_count: src.get_u16(),
        })
    }

    /// Writes this header.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u8(MSG_REMAINING_HEADER_SIZE as u8);
        dst.put_u8(self.info1);
        dst.put_u8(self.info2);
        dst.put_u8(self.info3);
        dst.put_u8(0);
        dst.put_u8(self.result_code);
        dst.put_u32(self.generation);
        dst.put_u32(self.expiration);
        dst.put_u32(self.timeout);
        dst.put_u16(self.field_count);
        dst.put_u16(self.op_count);
    }

    /// Result code of this message.
    pub fn result(&self) -> ResultCode {
        ResultCode::from_wire(self.result_code)
    }

    /// True on the final message of a stream.
    pub fn is_last(&self) -> bool {
        self.info3 & INFO3_LAST != 0
    }

    /// True on a partition-done marker of a partition scan.
    pub fn is_partition_done(&self) -> bool {
        self.info3 & INFO3_PARTITION_DONE != 0
    }
}
