//! Filter expressions evaluated by the server.
//!
//! An [`Expression`] is a tree built from bin reads, record metadata,
//! literal values and operators. It is packed as MessagePack and sent with
//! a command; records it evaluates false for are skipped by scans and
//! queries and fail single-record commands with
//! [`ResultCode::FilteredOut`](crate::ResultCode::FilteredOut).
//!
//! ```
//! use aerospike_core::expression::{ExpType, Expression};
//!
//! let filter = Expression::and(vec![
//!     Expression::ge(Expression::int_bin("age"), Expression::int(21)),
//!     Expression::not(Expression::is_tombstone()),
//! ]);
//! assert!(!filter.pack().unwrap().is_empty());
//! # let _ = ExpType::Int;
//! ```

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::msgpack;
use crate::serialization::DataOutput;
use crate::value::Value;

/// Value type an expression reads or yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExpType {
    /// Nil.
    Nil = 0,
    /// Boolean.
    Bool = 1,
    /// 64-bit integer.
    Int = 2,
    /// String.
    String = 3,
    /// List.
    List = 4,
    /// Map.
    Map = 5,
    /// Byte array.
    Blob = 6,
    /// 64-bit float.
    Float = 7,
    /// GeoJSON.
    Geo = 8,
    /// HyperLogLog.
    Hll = 9,
}

/// Flags for [`Expression::regex_compare`].
pub mod regex_flags {
    /// POSIX basic syntax.
    pub const NONE: i64 = 0;
    /// POSIX extended syntax.
    pub const EXTENDED: i64 = 1;
    /// Case insensitive.
    pub const ICASE: i64 = 1 << 1;
    /// Match position not reported.
    pub const NOSUB: i64 = 1 << 2;
    /// Match-any-character operators don't match a newline.
    pub const NEWLINE: i64 = 1 << 3;
}

const EQ: u8 = 1;
const NE: u8 = 2;
const GT: u8 = 3;
const GE: u8 = 4;
const LT: u8 = 5;
const LE: u8 = 6;
const REGEX: u8 = 7;
const AND: u8 = 16;
const OR: u8 = 17;
const NOT: u8 = 18;
const EXCLUSIVE: u8 = 19;
const ADD: u8 = 20;
const SUB: u8 = 21;
const MUL: u8 = 22;
const DIGEST_MODULO: u8 = 64;
const DEVICE_SIZE: u8 = 65;
const LAST_UPDATE: u8 = 66;
const SINCE_UPDATE: u8 = 67;
const VOID_TIME: u8 = 68;
const TTL: u8 = 69;
const SET_NAME: u8 = 70;
const KEY_EXISTS: u8 = 71;
const IS_TOMBSTONE: u8 = 72;
const KEY: u8 = 80;
const BIN: u8 = 81;
const BIN_TYPE: u8 = 82;
const QUOTED: u8 = 126;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    /// A literal.
    Value(Value),
    /// `[op]`
    Command(u8),
    /// `[op, value]`
    CommandValue(u8, Value),
    /// `[op, args...]`
    Call(u8, Vec<Expression>),
    /// `[BIN, type, name]`
    Bin(ExpType, String),
    /// `[BIN_TYPE, name]`
    BinType(String),
    /// `[REGEX, flags, regex, bin]`
    Regex {
        regex: String,
        flags: i64,
        bin: Box<Expression>,
    },
}

/// A server-side predicate or value.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    node: Node,
}

impl Expression {
    fn new(node: Node) -> Self {
        Self { node }
    }

    fn call(op: u8, args: Vec<Expression>) -> Self {
        Self::new(Node::Call(op, args))
    }

    /// A literal value. Lists are quoted so they are not read as calls.
    pub fn value(value: impl Into<Value>) -> Self {
        match value.into() {
            list @ Value::List(_) => Self::new(Node::CommandValue(QUOTED, list)),
            other => Self::new(Node::Value(other)),
        }
    }

    /// An integer literal.
    pub fn int(value: i64) -> Self {
        Self::value(value)
    }

    /// A float literal.
    pub fn float(value: f64) -> Self {
        Self::value(value)
    }

    /// A string literal.
    pub fn string(value: impl Into<String>) -> Self {
        Self::value(Value::String(value.into()))
    }

    /// A boolean literal.
    pub fn bool(value: bool) -> Self {
        Self::value(value)
    }

    /// A blob literal.
    pub fn blob(value: Vec<u8>) -> Self {
        Self::value(Value::Blob(value))
    }

    /// A nil literal.
    pub fn nil() -> Self {
        Self::value(Value::Nil)
    }

    /// Reads a bin as `exp_type`.
    pub fn bin(name: impl Into<String>, exp_type: ExpType) -> Self {
        Self::new(Node::Bin(exp_type, name.into()))
    }

    /// Reads an integer bin.
    pub fn int_bin(name: impl Into<String>) -> Self {
        Self::bin(name, ExpType::Int)
    }

    /// Reads a float bin.
    pub fn float_bin(name: impl Into<String>) -> Self {
        Self::bin(name, ExpType::Float)
    }

    /// Reads a string bin.
    pub fn string_bin(name: impl Into<String>) -> Self {
        Self::bin(name, ExpType::String)
    }

    /// Reads a blob bin.
    pub fn blob_bin(name: impl Into<String>) -> Self {
        Self::bin(name, ExpType::Blob)
    }

    /// Reads a list bin.
    pub fn list_bin(name: impl Into<String>) -> Self {
        Self::bin(name, ExpType::List)
    }

    /// Reads a map bin.
    pub fn map_bin(name: impl Into<String>) -> Self {
        Self::bin(name, ExpType::Map)
    }

    /// Particle type of a bin, zero when the bin is missing.
    pub fn bin_type(name: impl Into<String>) -> Self {
        Self::new(Node::BinType(name.into()))
    }

    /// True when the bin exists.
    pub fn bin_exists(name: impl Into<String>) -> Self {
        Self::ne(Self::bin_type(name), Self::int(0))
    }

    /// The stored user key read as `exp_type`.
    pub fn key(exp_type: ExpType) -> Self {
        Self::new(Node::CommandValue(KEY, Value::Int(exp_type as i64)))
    }

    /// True when the user key was stored with the record.
    pub fn key_exists() -> Self {
        Self::new(Node::Command(KEY_EXISTS))
    }

    /// Set name of the record.
    pub fn set_name() -> Self {
        Self::new(Node::Command(SET_NAME))
    }

    /// Storage size of the record in bytes.
    pub fn device_size() -> Self {
        Self::new(Node::Command(DEVICE_SIZE))
    }

    /// Last update time in nanoseconds since the epoch.
    pub fn last_update() -> Self {
        Self::new(Node::Command(LAST_UPDATE))
    }

    /// Milliseconds since the last update.
    pub fn since_update() -> Self {
        Self::new(Node::Command(SINCE_UPDATE))
    }

    /// Expiration time in nanoseconds since the epoch.
    pub fn void_time() -> Self {
        Self::new(Node::Command(VOID_TIME))
    }

    /// Seconds until the record expires.
    pub fn ttl() -> Self {
        Self::new(Node::Command(TTL))
    }

    /// True for a durable delete tombstone.
    pub fn is_tombstone() -> Self {
        Self::new(Node::Command(IS_TOMBSTONE))
    }

    /// Digest modulo `modulus`, for sampling a fraction of records.
    pub fn digest_modulo(modulus: i64) -> Self {
        Self::new(Node::CommandValue(DIGEST_MODULO, Value::Int(modulus)))
    }

    /// Matches a string expression against a POSIX regex.
    pub fn regex_compare(regex: impl Into<String>, flags: i64, bin: Expression) -> Self {
        Self::new(Node::Regex {
            regex: regex.into(),
            flags,
            bin: Box::new(bin),
        })
    }

    /// `left == right`
    pub fn eq(left: Expression, right: Expression) -> Self {
        Self::call(EQ, vec![left, right])
    }

    /// `left != right`
    pub fn ne(left: Expression, right: Expression) -> Self {
        Self::call(NE, vec![left, right])
    }

    /// `left > right`
    pub fn gt(left: Expression, right: Expression) -> Self {
        Self::call(GT, vec![left, right])
    }

    /// `left >= right`
    pub fn ge(left: Expression, right: Expression) -> Self {
        Self::call(GE, vec![left, right])
    }

    /// `left < right`
    pub fn lt(left: Expression, right: Expression) -> Self {
        Self::call(LT, vec![left, right])
    }

    /// `left <= right`
    pub fn le(left: Expression, right: Expression) -> Self {
        Self::call(LE, vec![left, right])
    }

    /// True when every expression is true.
    pub fn and(exps: Vec<Expression>) -> Self {
        Self::call(AND, exps)
    }

    /// True when any expression is true.
    pub fn or(exps: Vec<Expression>) -> Self {
        Self::call(OR, exps)
    }

    /// True when exactly one expression is true.
    pub fn exclusive(exps: Vec<Expression>) -> Self {
        Self::call(EXCLUSIVE, exps)
    }

    /// Negation.
    pub fn not(exp: Expression) -> Self {
        Self::call(NOT, vec![exp])
    }

    /// Sum of numeric expressions.
    pub fn num_add(exps: Vec<Expression>) -> Self {
        Self::call(ADD, exps)
    }

    /// First expression minus the rest.
    pub fn num_sub(exps: Vec<Expression>) -> Self {
        Self::call(SUB, exps)
    }

    /// Product of numeric expressions.
    pub fn num_mul(exps: Vec<Expression>) -> Self {
        Self::call(MUL, exps)
    }

    /// Packs the expression.
    pub fn pack(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        self.pack_to(&mut out)?;
        Ok(out.freeze())
    }

    /// Packs the expression into `out`.
    pub fn pack_to(&self, out: &mut dyn DataOutput) -> Result<()> {
        match &self.node {
            Node::Value(v) => msgpack::pack_value(out, v),
            Node::Command(op) => {
                msgpack::pack_array_begin(out, 1)?;
                msgpack::pack_i64(out, *op as i64)
            }
            Node::CommandValue(op, v) => {
                msgpack::pack_array_begin(out, 2)?;
                msgpack::pack_i64(out, *op as i64)?;
                msgpack::pack_value(out, v)
            }
            Node::Call(op, args) => {
                msgpack::pack_array_begin(out, args.len() + 1)?;
                msgpack::pack_i64(out, *op as i64)?;
                for arg in args {
                    arg.pack_to(out)?;
                }
                Ok(())
            }
            Node::Bin(exp_type, name) => {
                msgpack::pack_array_begin(out, 3)?;
                msgpack::pack_i64(out, BIN as i64)?;
                msgpack::pack_i64(out, *exp_type as i64)?;
                msgpack::pack_raw_string(out, name)
            }
            Node::BinType(name) => {
                msgpack::pack_array_begin(out, 2)?;
                msgpack::pack_i64(out, BIN_TYPE as i64)?;
                msgpack::pack_raw_string(out, name)
            }
            Node::Regex { regex, flags, bin } => {
                msgpack::pack_array_begin(out, 4)?;
                msgpack::pack_i64(out, REGEX as i64)?;
                msgpack::pack_i64(out, *flags)?;
                msgpack::pack_raw_string(out, regex)?;
                bin.pack_to(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_int_bin() {
        let exp = Expression::eq(Expression::int_bin("a"), Expression::int(7));
        assert_eq!(
            exp.pack().unwrap().as_ref(),
            &[0x93, EQ, 0x93, BIN, ExpType::Int as u8, 0xa1, b'a', 0x07]
        );
    }

    #[test]
    fn test_string_literal_carries_particle_type() {
        let exp = Expression::string("x");
        assert_eq!(exp.pack().unwrap().as_ref(), &[0xa2, 3, b'x']);
    }

    #[test]
    fn test_metadata_and_logic() {
        let exp = Expression::and(vec![
            Expression::key_exists(),
            Expression::not(Expression::is_tombstone()),
        ]);
        assert_eq!(
            exp.pack().unwrap().as_ref(),
            &[0x93, AND, 0x91, KEY_EXISTS, 0x92, NOT, 0x91, IS_TOMBSTONE]
        );
    }

    #[test]
    fn test_list_literal_is_quoted() {
        let exp = Expression::value(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(exp.pack().unwrap().as_ref(), &[0x92, QUOTED, 0x92, 1, 2]);
    }

    #[test]
    fn test_bin_exists_compares_type() {
        let exp = Expression::bin_exists("b");
        assert_eq!(
            exp.pack().unwrap().as_ref(),
            &[0x93, NE, 0x92, BIN_TYPE, 0xa1, b'b', 0x00]
        );
    }

    #[test]
    fn test_regex_layout() {
        let exp = Expression::regex_compare("^a", regex_flags::ICASE, Expression::string_bin("s"));
        let packed = exp.pack().unwrap();
        assert_eq!(
            packed.as_ref(),
            &[0x94, REGEX, 2, 0xa2, b'^', b'a', 0x93, BIN, ExpType::String as u8, 0xa1, b's']
        );
    }

    #[test]
    fn test_digest_modulo_and_key() {
        assert_eq!(
            Expression::digest_modulo(3).pack().unwrap().as_ref(),
            &[0x92, DIGEST_MODULO, 3]
        );
        assert_eq!(
            Expression::key(ExpType::String).pack().unwrap().as_ref(),
            &[0x92, KEY, 3]
        );
    }
}
