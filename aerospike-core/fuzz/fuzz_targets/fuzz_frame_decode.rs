#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

use aerospike_core::protocol::{MessageHeader, ProtoCodec, AS_MSG_TYPE};

fuzz_target!(|data: &[u8]| {
    let mut codec = ProtoCodec::new();
    let mut buf = BytesMut::from(data);

    while !buf.is_empty() {
        match codec.decode(&mut buf) {
            Ok(Some(frame)) => {
                let _ = frame.wire_size();
                if frame.message_type == AS_MSG_TYPE {
                    let mut body = &frame.body[..];
                    let _ = MessageHeader::read_from(&mut body);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
});
