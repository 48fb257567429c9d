//! Codec implementation for encoding/decoding Aerospike protocol frames.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::compression::inflate_body;
use super::constants::*;
use super::frame::Frame;
use crate::error::{Error, Result};

/// Codec for encoding and decoding proto frames.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O. Compressed (type 4) frames are inflated on
/// decode and surface as regular data frames.
#[derive(Debug, Default)]
pub struct ProtoCodec {
    /// Number of compressed frames inflated so far.
    inflated_frames: u64,
}

impl ProtoCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self { inflated_frames: 0 }
    }

    /// Returns how many compressed frames this codec has inflated.
    pub fn inflated_frames(&self) -> u64 {
        self.inflated_frames
    }
}

impl Encoder<Frame> for ProtoCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        item.header().validate()?;
        item.write_to(dst);
        Ok(())
    }
}

impl Decoder for ProtoCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let frame = match Frame::read_from(src)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        if frame.message_type != AS_MSG_TYPE_COMPRESSED {
            return Ok(Some(frame));
        }

        let (message_type, body) = inflate_body(&frame.body)?;
        if message_type == AS_MSG_TYPE_COMPRESSED {
            return Err(Error::Protocol(
                "nested compressed frame".to_string(),
            ));
        }
        self.inflated_frames += 1;
        tracing::trace!(
            compressed = frame.body.len(),
            inflated = body.len(),
            "inflated compressed frame"
        );
        Ok(Some(Frame::new(message_type, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compression::compress_request;
    use crate::protocol::ProtoHeader;
    use bytes::BufMut;

    #[test]
    fn test_encode_decode_info_frame() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::info("node\n"), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.message_type, AS_INFO_MESSAGE_TYPE);
        assert_eq!(&decoded.body[..], b"node\n");
    }

    #[test]
    fn test_decode_incomplete_frame() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::new();
        ProtoHeader::new(AS_MSG_TYPE, 22).write_to(&mut buf);
        buf.put_slice(&[22, 0, 0]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_garbage_header() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::from(&b"HTTP/1.1 400 Bad"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_inflates_compressed_frame() {
        let mut compressed = BytesMut::new();
        let body: Vec<u8> = (0..1000u32).map(|i| (i % 13) as u8).collect();
        Frame::message(BytesMut::from(&body[..])).write_to(&mut compressed);
        compress_request(&mut compressed).unwrap();

        let mut codec = ProtoCodec::new();
        let decoded = codec.decode(&mut compressed).unwrap().unwrap();
        assert_eq!(decoded.message_type, AS_MSG_TYPE);
        assert_eq!(&decoded.body[..], &body[..]);
        assert_eq!(codec.inflated_frames(), 1);
    }

    #[test]
    fn test_decode_two_frames_in_one_buffer() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::new();
        Frame::info("a\n").write_to(&mut buf);
        Frame::info("b\n").write_to(&mut buf);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.body[..], b"a\n");
        assert_eq!(&second.body[..], b"b\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
