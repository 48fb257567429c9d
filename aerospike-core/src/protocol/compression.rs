//! zlib compression of requests and inflation of compressed responses.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::constants::*;
use super::frame::ProtoHeader;
use crate::error::{Error, Result};

/// Deflate input is fed in chunks of this size; some zlib builds corrupt
/// the stream when a single write exceeds 64 KiB.
pub const DEFLATE_CHUNK_SIZE: usize = 64 * 1024;

/// Returns true if a request of `size` bytes should be compressed.
pub fn should_compress(enabled: bool, size: usize) -> bool {
    enabled && size > COMPRESS_THRESHOLD
}

/// Compresses a complete request (proto header included) in place.
///
/// `buf` is rewritten as a type 4 frame: a proto header whose length covers
/// the 8-byte uncompressed size plus the zlib stream, followed by that size
/// and the stream itself. The buffer keeps its capacity.
pub fn compress_request(buf: &mut BytesMut) -> Result<()> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(buf.len() / 2 + ZLIB_HEADER_PAD),
        Compression::default(),
    );
    for chunk in buf.chunks(DEFLATE_CHUNK_SIZE) {
        encoder
            .write_all(chunk)
            .map_err(|e| Error::Serialization(format!("failed to deflate request: {}", e)))?;
    }
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Serialization(format!("failed to finish deflate: {}", e)))?;

    let original = buf.len();
    buf.clear();
    buf.reserve(MSG_HEADER_PAD + compressed.len());
    ProtoHeader::new(AS_MSG_TYPE_COMPRESSED, compressed.len() + 8).write_to(buf);
    buf.put_u64(original as u64);
    buf.put_slice(&compressed);
    Ok(())
}

/// Inflates the body of a type 4 frame.
///
/// `body` starts with the 8-byte uncompressed size; the inflated bytes are a
/// complete frame with its own proto header, which is validated and stripped.
/// Returns the inner message type and body.
pub fn inflate_body(body: &[u8]) -> Result<(u8, BytesMut)> {
    if body.len() < 8 {
        return Err(Error::Protocol(
            "compressed body shorter than its size prefix".to_string(),
        ));
    }

    let mut raw = [0u8; 8];
    raw.copy_from_slice(&body[..8]);
    let expected = u64::from_be_bytes(raw) as usize;
    if expected > MAX_BUFFER_SIZE || expected < PROTO_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "invalid uncompressed size: {}",
            expected
        )));
    }

    let mut inflated = Vec::with_capacity(expected);
    ZlibDecoder::new(&body[8..])
        .take(expected as u64)
        .read_to_end(&mut inflated)
        .map_err(|e| Error::Protocol(format!("failed to inflate response: {}", e)))?;

    if inflated.len() != expected {
        return Err(Error::Protocol(format!(
            "inflated {} bytes, expected {}",
            inflated.len(),
            expected
        )));
    }

    let inner = ProtoHeader::parse(&inflated)?;
    if inner.size != expected - PROTO_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "inner frame size {} does not match inflated size {}",
            inner.size,
            expected - PROTO_HEADER_SIZE
        )));
    }

    Ok((
        inner.message_type,
        BytesMut::from(&inflated[PROTO_HEADER_SIZE..]),
    ))
}
