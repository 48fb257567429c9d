//! Proto header and frame types for the Aerospike binary protocol.

use bytes::{Buf, BufMut, BytesMut};

use super::constants::*;
use crate::error::{Error, Result};

/// The 8-byte header in front of every request and response.
///
/// Bits 63..56 carry the version, bits 55..48 the message type and the low
/// 48 bits the length of the body that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    /// Protocol version.
    pub version: u8,
    /// Message type (info, admin, message or compressed message).
    pub message_type: u8,
    /// Length of the body in bytes.
    pub size: usize,
}

impl ProtoHeader {
    /// Creates a header of the current protocol version.
    pub fn new(message_type: u8, size: usize) -> Self {
        Self {
            version: CL_MSG_VERSION,
            message_type,
            size,
        }
    }

    /// Packs this header into its 64-bit wire form.
    pub fn to_u64(&self) -> u64 {
        ((self.version as u64) << 56)
            | ((self.message_type as u64) << 48)
            | (self.size as u64 & 0xFFFF_FFFF_FFFF)
    }

    /// Unpacks a header without validating it.
    pub fn from_u64(value: u64) -> Self {
        Self {
            version: (value >> 56) as u8,
            message_type: ((value >> 48) & 0xFF) as u8,
            size: (value & 0xFFFF_FFFF_FFFF) as usize,
        }
    }

    /// Parses and validates a header from the first 8 bytes of `src`.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < PROTO_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "proto header requires {} bytes, have {}",
                PROTO_HEADER_SIZE,
                src.len()
            )));
        }
        let mut raw = [0u8; PROTO_HEADER_SIZE];
        raw.copy_from_slice(&src[..PROTO_HEADER_SIZE]);
        let header = Self::from_u64(u64::from_be_bytes(raw));
        header.validate()?;
        Ok(header)
    }

    /// Checks version, type and size bounds.
    pub fn validate(&self) -> Result<()> {
        if self.version != CL_MSG_VERSION {
            return Err(Error::Protocol(format!(
                "invalid protocol version: {}",
                self.version
            )));
        }

        match self.message_type {
            AS_INFO_MESSAGE_TYPE | AS_ADMIN_MESSAGE_TYPE | AS_MSG_TYPE
            | AS_MSG_TYPE_COMPRESSED => {}
            other => {
                return Err(Error::Protocol(format!("invalid message type: {}", other)));
            }
        }

        if self.size > MAX_BUFFER_SIZE {
            return Err(Error::Protocol(format!(
                "invalid message size: {} exceeds {}",
                self.size, MAX_BUFFER_SIZE
            )));
        }

        Ok(())
    }

    /// Returns true if the body is zlib compressed.
    pub fn is_compressed(&self) -> bool {
        self.message_type == AS_MSG_TYPE_COMPRESSED
    }

    /// Writes the header to the given buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u64(self.to_u64());
    }
}

/// A complete protocol frame: header type plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type from the proto header.
    pub message_type: u8,
    /// Bytes following the proto header.
    pub body: BytesMut,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(message_type: u8, body: BytesMut) -> Self {
        Self { message_type, body }
    }

    /// Creates an info frame from newline separated commands.
    pub fn info(body: impl AsRef<[u8]>) -> Self {
        Self::new(AS_INFO_MESSAGE_TYPE, BytesMut::from(body.as_ref()))
    }

    /// Creates a data message frame.
    pub fn message(body: BytesMut) -> Self {
        Self::new(AS_MSG_TYPE, body)
    }

    /// Returns the proto header describing this frame.
    pub fn header(&self) -> ProtoHeader {
        ProtoHeader::new(self.message_type, self.body.len())
    }

    /// Returns the size of this frame on the wire.
    pub fn wire_size(&self) -> usize {
        PROTO_HEADER_SIZE + self.body.len()
    }

    /// Writes this frame to the given buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_size());
        self.header().write_to(dst);
        dst.put_slice(&self.body);
    }

    /// Reads a frame from the given buffer.
    ///
    /// Returns `Ok(None)` if there isn't enough data to read a complete frame
    /// and an error if the header is malformed.
    pub fn read_from(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < PROTO_HEADER_SIZE {
            return Ok(None);
        }

        let header = ProtoHeader::parse(&src[..PROTO_HEADER_SIZE])?;
        if src.len() < PROTO_HEADER_SIZE + header.size {
            src.reserve(PROTO_HEADER_SIZE + header.size - src.len());
            return Ok(None);
        }

        src.advance(PROTO_HEADER_SIZE);
        let body = src.split_to(header.size);
        Ok(Some(Self::new(header.message_type, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bit_layout() {
        let header = ProtoHeader::new(AS_MSG_TYPE, 0x2A);
        assert_eq!(header.to_u64(), 0x0203_0000_0000_002A);
        assert_eq!(ProtoHeader::from_u64(0x0203_0000_0000_002A), header);
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let raw = 0x0303_0000_0000_0010u64.to_be_bytes();
        let err = ProtoHeader::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("invalid protocol version"));
    }

    #[test]
    fn test_header_rejects_bad_type() {
        let raw = 0x0209_0000_0000_0010u64.to_be_bytes();
        assert!(ProtoHeader::parse(&raw).is_err());
    }

    #[test]
    fn test_header_rejects_oversized_body() {
        let header = ProtoHeader::new(AS_MSG_TYPE, MAX_BUFFER_SIZE + 1);
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_frame_incomplete() {
        let mut buf = BytesMut::from(&[0x02, 0x01, 0, 0][..]);
        assert!(Frame::read_from(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::new();
        ProtoHeader::new(AS_INFO_MESSAGE_TYPE, 10).write_to(&mut buf);
        buf.put_slice(b"node");
        assert!(Frame::read_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 12);
    }

    #[test]
    fn test_write_and_read_info_frame() {
        let frame = Frame::info("node\nbuild\n");
        let mut buf = BytesMut::new();
        frame.write_to(&mut buf);
        assert_eq!(buf.len(), frame.wire_size());
        assert_eq!(&buf[..2], &[2, 1]);

        let decoded = Frame::read_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }
}
