//! Aerospike binary wire protocol.
//!
//! Every exchange is a proto frame: an 8-byte header (version, type, 48-bit
//! length) followed by a body. Data messages carry a 22-byte message header,
//! fields and operations; info messages carry newline separated text; admin
//! messages carry security commands. Compressed frames wrap a whole data frame
//! in a zlib stream.

pub mod compression;
pub mod constants;
pub mod info;
mod codec;
mod frame;
mod message;

pub use codec::ProtoCodec;
pub use constants::*;
pub use frame::{Frame, ProtoHeader};
pub use message::MessageHeader;
