//! Byte-level readers and writers plus the caller-type mapping traits.

mod data_input;
mod data_output;
mod traits;

pub use data_input::{BufferReader, DataInput};
pub use data_output::{DataOutput, SizeCounter};
pub use traits::{
    parse_field, to_bins, to_value, Parsable, ParseNode, RecordParseNode, Serializable,
    SerializationWriter, ValueParseNode, ValueWriter,
};
