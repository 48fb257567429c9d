//! Core types and wire protocol for the Aerospike client.
//!
//! This crate has no networking. It defines keys, values, records and
//! operations, the binary and info protocols, and the error taxonomy shared
//! by the client.

#![warn(missing_docs)]

pub mod bin;
pub mod error;
pub mod expression;
pub mod key;
pub mod msgpack;
pub mod operation;
pub mod protocol;
pub mod record;
pub mod result_code;
pub mod serialization;
pub mod value;

pub use bin::Bin;
pub use error::{Error, Result};
pub use expression::{ExpType, Expression};
pub use key::Key;
pub use operation::{CdtContext, Operation, OperationType, ReturnType};
pub use record::Record;
pub use result_code::ResultCode;
pub use serialization::{Parsable, ParseNode, Serializable, SerializationWriter};
pub use value::Value;
