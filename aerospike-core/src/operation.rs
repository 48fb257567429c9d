//! Record operations, including list and map (CDT) operations.

use crate::bin::{validate_bin_name, Bin};
use crate::error::Result;
use crate::msgpack;
use crate::protocol::{ParticleType, OPERATION_HEADER_SIZE};
use crate::serialization::{DataOutput, SizeCounter};
use crate::value::Value;

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationType {
    /// Read a bin or the whole record.
    Read = 1,
    /// Write a bin.
    Write = 2,
    /// Read from a list or map.
    CdtRead = 3,
    /// Modify a list or map.
    CdtModify = 4,
    /// Add to an integer or float bin.
    Add = 5,
    /// Evaluate an expression.
    ExpRead = 7,
    /// Write the result of an expression.
    ExpModify = 8,
    /// Append to a string or blob.
    Append = 9,
    /// Prepend to a string or blob.
    Prepend = 10,
    /// Reset the record time to live.
    Touch = 11,
    /// Read bits from a blob.
    BitRead = 12,
    /// Modify bits in a blob.
    BitModify = 13,
    /// Delete the record.
    Delete = 14,
    /// Read from a HyperLogLog.
    HllRead = 15,
    /// Modify a HyperLogLog.
    HllModify = 16,
}

impl OperationType {
    /// Returns true if the operation changes the record.
    pub fn is_write(self) -> bool {
        !matches!(
            self,
            OperationType::Read
                | OperationType::CdtRead
                | OperationType::ExpRead
                | OperationType::BitRead
                | OperationType::HllRead
        )
    }
}

/// Locates a nested list or map element for a CDT operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CdtContext {
    /// Context type id.
    pub id: u8,
    /// Index, rank, key or value selecting the element.
    pub value: Value,
}

impl CdtContext {
    /// List element at an index.
    pub fn list_index(index: i64) -> Self {
        Self {
            id: 0x10,
            value: Value::Int(index),
        }
    }

    /// List element at a rank.
    pub fn list_rank(rank: i64) -> Self {
        Self {
            id: 0x11,
            value: Value::Int(rank),
        }
    }

    /// List element equal to a value.
    pub fn list_value(value: impl Into<Value>) -> Self {
        Self {
            id: 0x13,
            value: value.into(),
        }
    }

    /// Map entry at an index.
    pub fn map_index(index: i64) -> Self {
        Self {
            id: 0x20,
            value: Value::Int(index),
        }
    }

    /// Map entry at a rank.
    pub fn map_rank(rank: i64) -> Self {
        Self {
            id: 0x21,
            value: Value::Int(rank),
        }
    }

    /// Map entry with a key.
    pub fn map_key(key: impl Into<Value>) -> Self {
        Self {
            id: 0x22,
            value: key.into(),
        }
    }

    /// Map entry with a value.
    pub fn map_value(value: impl Into<Value>) -> Self {
        Self {
            id: 0x23,
            value: value.into(),
        }
    }
}

/// Payload of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationData {
    /// No payload.
    None,
    /// Read metadata only.
    HeaderOnly,
    /// A plain bin value.
    Value(Value),
    /// A packed CDT call.
    Cdt {
        /// CDT op code.
        op: u8,
        /// Path to the nested element.
        ctx: Vec<CdtContext>,
        /// Op arguments.
        args: Vec<Value>,
    },
}

/// A single operation inside a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Operation code.
    pub op_type: OperationType,
    /// Target bin; empty for record-level operations.
    pub bin_name: String,
    /// Payload.
    pub data: OperationData,
}

impl Operation {
    /// Reads all bins.
    pub fn get() -> Self {
        Self::record_level(OperationType::Read, OperationData::None)
    }

    /// Reads generation and expiration only.
    pub fn get_header() -> Self {
        Self::record_level(OperationType::Read, OperationData::HeaderOnly)
    }

    /// Reads one bin.
    pub fn get_bin(name: impl Into<String>) -> Self {
        Self {
            op_type: OperationType::Read,
            bin_name: name.into(),
            data: OperationData::None,
        }
    }

    /// Writes a bin.
    pub fn put(bin: Bin) -> Self {
        Self::with_bin(OperationType::Write, bin)
    }

    /// Appends to a string or blob bin.
    pub fn append(bin: Bin) -> Self {
        Self::with_bin(OperationType::Append, bin)
    }

    /// Prepends to a string or blob bin.
    pub fn prepend(bin: Bin) -> Self {
        Self::with_bin(OperationType::Prepend, bin)
    }

    /// Adds to an integer or float bin.
    pub fn add(bin: Bin) -> Self {
        Self::with_bin(OperationType::Add, bin)
    }

    /// Resets the record time to live.
    pub fn touch() -> Self {
        Self::record_level(OperationType::Touch, OperationData::None)
    }

    /// Deletes the record.
    pub fn delete() -> Self {
        Self::record_level(OperationType::Delete, OperationData::None)
    }

    fn record_level(op_type: OperationType, data: OperationData) -> Self {
        Self {
            op_type,
            bin_name: String::new(),
            data,
        }
    }

    fn with_bin(op_type: OperationType, bin: Bin) -> Self {
        Self {
            op_type,
            bin_name: bin.name,
            data: OperationData::Value(bin.value),
        }
    }

    fn cdt(op_type: OperationType, bin_name: &str, op: u8, ctx: &[CdtContext], args: Vec<Value>) -> Self {
        Self {
            op_type,
            bin_name: bin_name.to_string(),
            data: OperationData::Cdt {
                op,
                ctx: ctx.to_vec(),
                args,
            },
        }
    }

    /// Returns true if this operation only wants metadata.
    pub fn is_header_only(&self) -> bool {
        matches!(self.data, OperationData::HeaderOnly)
    }

    /// Particle type written in the op header.
    pub fn particle_type(&self) -> ParticleType {
        match &self.data {
            OperationData::None | OperationData::HeaderOnly => ParticleType::Null,
            OperationData::Value(v) => v.particle_type(),
            OperationData::Cdt { .. } => ParticleType::Blob,
        }
    }

    /// Size of the payload in bytes.
    pub fn value_size(&self) -> Result<usize> {
        match &self.data {
            OperationData::None | OperationData::HeaderOnly => Ok(0),
            OperationData::Value(v) => v.estimate_size(),
            OperationData::Cdt { .. } => {
                let mut counter = SizeCounter::new();
                self.write_value(&mut counter)?;
                Ok(counter.count())
            }
        }
    }

    /// Size of the whole operation on the wire.
    pub fn estimate_size(&self) -> Result<usize> {
        validate_bin_name(&self.bin_name)?;
        Ok(OPERATION_HEADER_SIZE + self.bin_name.len() + self.value_size()?)
    }

    /// Writes the payload.
    pub fn write_value(&self, out: &mut dyn DataOutput) -> Result<()> {
        match &self.data {
            OperationData::None | OperationData::HeaderOnly => Ok(()),
            OperationData::Value(v) => v.write_to(out),
            OperationData::Cdt { op, ctx, args } => pack_cdt(out, *op, ctx, args),
        }
    }

    /// Writes the full operation: size, op code, particle type, name and
    /// payload.
    pub fn write_to(&self, out: &mut dyn DataOutput) -> Result<()> {
        let value_size = self.value_size()?;
        out.write_u32((self.bin_name.len() + value_size + 4) as u32)?;
        out.write_u8(self.op_type as u8)?;
        out.write_u8(self.particle_type() as u8)?;
        out.write_u8(0)?;
        out.write_u8(self.bin_name.len() as u8)?;
        out.write_bytes(self.bin_name.as_bytes())?;
        self.write_value(out)
    }
}

fn pack_cdt(out: &mut dyn DataOutput, op: u8, ctx: &[CdtContext], args: &[Value]) -> Result<()> {
    if !ctx.is_empty() {
        msgpack::pack_array_begin(out, 3)?;
        msgpack::pack_i64(out, 0xff)?;
        msgpack::pack_array_begin(out, ctx.len() * 2)?;
        for c in ctx {
            msgpack::pack_i64(out, c.id as i64)?;
            msgpack::pack_value(out, &c.value)?;
        }
    }
    msgpack::pack_array_begin(out, args.len() + 1)?;
    msgpack::pack_i64(out, op as i64)?;
    for arg in args {
        msgpack::pack_value(out, arg)?;
    }
    Ok(())
}

/// What a CDT read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnType {
    /// Nothing.
    None = 0,
    /// Index of the element.
    Index = 1,
    /// Reverse index.
    ReverseIndex = 2,
    /// Rank of the element.
    Rank = 3,
    /// Reverse rank.
    ReverseRank = 4,
    /// Number of matched elements.
    Count = 5,
    /// Map key.
    Key = 6,
    /// Element value.
    Value = 7,
    /// Map key and value.
    KeyValue = 8,
}

/// Bounds of a value or key interval; `begin` inclusive, `end` exclusive.
///
/// A `Nil` begin is unbounded below; a missing end is unbounded above.
fn interval(begin: Value, end: Option<Value>) -> Vec<Value> {
    let mut args = vec![begin];
    args.extend(end);
    args
}

/// List operations.
pub mod list {
    use super::*;

    const APPEND: u8 = 1;
    const APPEND_ITEMS: u8 = 2;
    const INSERT: u8 = 3;
    const POP: u8 = 5;
    const REMOVE: u8 = 7;
    const SET: u8 = 9;
    const CLEAR: u8 = 11;
    const INCREMENT: u8 = 12;
    const SORT: u8 = 13;
    const SIZE: u8 = 16;
    const GET: u8 = 17;
    const GET_RANGE: u8 = 18;
    const GET_BY_INDEX: u8 = 19;
    const GET_BY_RANK: u8 = 21;
    const GET_BY_VALUE: u8 = 22;
    const GET_BY_INDEX_RANGE: u8 = 24;
    const GET_BY_VALUE_INTERVAL: u8 = 25;
    const GET_BY_RANK_RANGE: u8 = 26;
    const REMOVE_BY_INDEX: u8 = 32;
    const REMOVE_BY_RANK: u8 = 34;
    const REMOVE_BY_VALUE: u8 = 35;
    const REMOVE_BY_VALUE_INTERVAL: u8 = 38;

    /// Storage order of a list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(u8)]
    pub enum ListOrder {
        /// Insertion order.
        #[default]
        Unordered = 0,
        /// Sorted by value.
        Ordered = 1,
    }

    /// Write flags for list modifications.
    pub mod write_flags {
        /// Allow duplicates and out of bounds inserts.
        pub const DEFAULT: i64 = 0;
        /// Only add values not already in the list.
        pub const ADD_UNIQUE: i64 = 1;
        /// Fail inserts beyond the end of the list.
        pub const INSERT_BOUNDED: i64 = 2;
        /// Skip failing values instead of failing the operation.
        pub const NO_FAIL: i64 = 4;
        /// With `NO_FAIL`, commit the values that succeed.
        pub const PARTIAL: i64 = 8;
    }

    /// Sort flags for [`sort`].
    pub mod sort_flags {
        /// Ascending.
        pub const DEFAULT: i64 = 0;
        /// Descending.
        pub const DESCENDING: i64 = 1;
        /// Drop duplicate values.
        pub const DROP_DUPLICATES: i64 = 2;
    }

    /// Order and write flags applied when a modification creates or
    /// changes a list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ListPolicy {
        /// Order of a list the operation creates.
        pub order: ListOrder,
        /// Bitwise or of [`write_flags`].
        pub flags: i64,
    }

    impl ListPolicy {
        fn args(&self) -> [Value; 2] {
            [Value::Int(self.order as i64), Value::Int(self.flags)]
        }
    }

    /// Appends a value.
    pub fn append(bin: &str, ctx: &[CdtContext], value: impl Into<Value>) -> Operation {
        Operation::cdt(OperationType::CdtModify, bin, APPEND, ctx, vec![value.into()])
    }

    /// Appends a value, creating the list with `policy` if needed.
    pub fn append_with_policy(
        policy: &ListPolicy,
        bin: &str,
        ctx: &[CdtContext],
        value: impl Into<Value>,
    ) -> Operation {
        let mut args = vec![value.into()];
        args.extend(policy.args());
        Operation::cdt(OperationType::CdtModify, bin, APPEND, ctx, args)
    }

    /// Appends every value of a list.
    pub fn append_items(bin: &str, ctx: &[CdtContext], values: Vec<Value>) -> Operation {
        Operation::cdt(
            OperationType::CdtModify,
            bin,
            APPEND_ITEMS,
            ctx,
            vec![Value::List(values)],
        )
    }

    /// Inserts a value at an index.
    pub fn insert(bin: &str, ctx: &[CdtContext], index: i64, value: impl Into<Value>) -> Operation {
        Operation::cdt(
            OperationType::CdtModify,
            bin,
            INSERT,
            ctx,
            vec![Value::Int(index), value.into()],
        )
    }

    /// Removes and returns the value at an index.
    pub fn pop(bin: &str, ctx: &[CdtContext], index: i64) -> Operation {
        Operation::cdt(OperationType::CdtModify, bin, POP, ctx, vec![Value::Int(index)])
    }

    /// Removes the value at an index.
    pub fn remove(bin: &str, ctx: &[CdtContext], index: i64) -> Operation {
        Operation::cdt(OperationType::CdtModify, bin, REMOVE, ctx, vec![Value::Int(index)])
    }

    /// Replaces the value at an index.
    pub fn set(bin: &str, ctx: &[CdtContext], index: i64, value: impl Into<Value>) -> Operation {
        Operation::cdt(
            OperationType::CdtModify,
            bin,
            SET,
            ctx,
            vec![Value::Int(index), value.into()],
        )
    }

    /// Removes every value.
    pub fn clear(bin: &str, ctx: &[CdtContext]) -> Operation {
        Operation::cdt(OperationType::CdtModify, bin, CLEAR, ctx, Vec::new())
    }

    /// Adds `value` to the number at an index and returns the result.
    pub fn increment(bin: &str, ctx: &[CdtContext], index: i64, value: impl Into<Value>) -> Operation {
        Operation::cdt(
            OperationType::CdtModify,
            bin,
            INCREMENT,
            ctx,
            vec![Value::Int(index), value.into()],
        )
    }

    /// Sorts the list in place.
    pub fn sort(bin: &str, ctx: &[CdtContext], flags: i64) -> Operation {
        Operation::cdt(OperationType::CdtModify, bin, SORT, ctx, vec![Value::Int(flags)])
    }

    /// Returns the element count.
    pub fn size(bin: &str, ctx: &[CdtContext]) -> Operation {
        Operation::cdt(OperationType::CdtRead, bin, SIZE, ctx, Vec::new())
    }

    /// Returns the value at an index.
    pub fn get(bin: &str, ctx: &[CdtContext], index: i64) -> Operation {
        Operation::cdt(OperationType::CdtRead, bin, GET, ctx, vec![Value::Int(index)])
    }

    /// Returns `count` values starting at an index.
    pub fn get_range(bin: &str, ctx: &[CdtContext], index: i64, count: i64) -> Operation {
        Operation::cdt(
            OperationType::CdtRead,
            bin,
            GET_RANGE,
            ctx,
            vec![Value::Int(index), Value::Int(count)],
        )
    }

    /// Selects the element at an index.
    pub fn get_by_index(bin: &str, ctx: &[CdtContext], index: i64, return_type: ReturnType) -> Operation {
        selector(OperationType::CdtRead, bin, GET_BY_INDEX, ctx, return_type, vec![Value::Int(index)])
    }

    /// Selects `count` elements starting at an index.
    pub fn get_by_index_range(
        bin: &str,
        ctx: &[CdtContext],
        index: i64,
        count: i64,
        return_type: ReturnType,
    ) -> Operation {
        selector(
            OperationType::CdtRead,
            bin,
            GET_BY_INDEX_RANGE,
            ctx,
            return_type,
            vec![Value::Int(index), Value::Int(count)],
        )
    }

    /// Selects the element with a rank; zero is the smallest.
    pub fn get_by_rank(bin: &str, ctx: &[CdtContext], rank: i64, return_type: ReturnType) -> Operation {
        selector(OperationType::CdtRead, bin, GET_BY_RANK, ctx, return_type, vec![Value::Int(rank)])
    }

    /// Selects `count` elements starting at a rank.
    pub fn get_by_rank_range(
        bin: &str,
        ctx: &[CdtContext],
        rank: i64,
        count: i64,
        return_type: ReturnType,
    ) -> Operation {
        selector(
            OperationType::CdtRead,
            bin,
            GET_BY_RANK_RANGE,
            ctx,
            return_type,
            vec![Value::Int(rank), Value::Int(count)],
        )
    }

    /// Selects every element equal to `value`.
    pub fn get_by_value(
        bin: &str,
        ctx: &[CdtContext],
        value: impl Into<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(OperationType::CdtRead, bin, GET_BY_VALUE, ctx, return_type, vec![value.into()])
    }

    /// Selects elements in `[begin, end)`.
    pub fn get_by_value_range(
        bin: &str,
        ctx: &[CdtContext],
        begin: impl Into<Value>,
        end: Option<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(
            OperationType::CdtRead,
            bin,
            GET_BY_VALUE_INTERVAL,
            ctx,
            return_type,
            interval(begin.into(), end),
        )
    }

    /// Removes the element at an index.
    pub fn remove_by_index(bin: &str, ctx: &[CdtContext], index: i64, return_type: ReturnType) -> Operation {
        selector(OperationType::CdtModify, bin, REMOVE_BY_INDEX, ctx, return_type, vec![Value::Int(index)])
    }

    /// Removes the element with a rank.
    pub fn remove_by_rank(bin: &str, ctx: &[CdtContext], rank: i64, return_type: ReturnType) -> Operation {
        selector(OperationType::CdtModify, bin, REMOVE_BY_RANK, ctx, return_type, vec![Value::Int(rank)])
    }

    /// Removes every element equal to `value`.
    pub fn remove_by_value(
        bin: &str,
        ctx: &[CdtContext],
        value: impl Into<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(OperationType::CdtModify, bin, REMOVE_BY_VALUE, ctx, return_type, vec![value.into()])
    }

    /// Removes elements in `[begin, end)`.
    pub fn remove_by_value_range(
        bin: &str,
        ctx: &[CdtContext],
        begin: impl Into<Value>,
        end: Option<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(
            OperationType::CdtModify,
            bin,
            REMOVE_BY_VALUE_INTERVAL,
            ctx,
            return_type,
            interval(begin.into(), end),
        )
    }
}

/// Builds a selector call: `[op, return_type, args...]`.
fn selector(
    op_type: OperationType,
    bin: &str,
    op: u8,
    ctx: &[CdtContext],
    return_type: ReturnType,
    selectors: Vec<Value>,
) -> Operation {
    let mut args = Vec::with_capacity(selectors.len() + 1);
    args.push(Value::Int(return_type as i64));
    args.extend(selectors);
    Operation::cdt(op_type, bin, op, ctx, args)
}

/// Map operations.
pub mod map {
    use super::*;

    const PUT: u8 = 67;
    const INCREMENT: u8 = 73;
    const CLEAR: u8 = 75;
    const REMOVE_BY_KEY: u8 = 76;
    const REMOVE_BY_RANK: u8 = 79;
    const REMOVE_BY_VALUE: u8 = 82;
    const REMOVE_BY_KEY_INTERVAL: u8 = 84;
    const SIZE: u8 = 96;
    const GET_BY_KEY: u8 = 97;
    const GET_BY_INDEX: u8 = 98;
    const GET_BY_RANK: u8 = 100;
    const GET_BY_VALUE: u8 = 102;
    const GET_BY_KEY_INTERVAL: u8 = 103;
    const GET_BY_VALUE_INTERVAL: u8 = 105;
    const GET_BY_RANK_RANGE: u8 = 106;

    /// Storage order of a map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(u8)]
    pub enum MapOrder {
        /// No order.
        #[default]
        Unordered = 0,
        /// Sorted by key.
        KeyOrdered = 1,
        /// Sorted by key and value.
        KeyValueOrdered = 3,
    }

    /// Write flags for map puts.
    pub mod write_flags {
        /// Create or update.
        pub const DEFAULT: i64 = 0;
        /// Fail if the key exists.
        pub const CREATE_ONLY: i64 = 1;
        /// Fail if the key is missing.
        pub const UPDATE_ONLY: i64 = 2;
        /// Skip failing entries instead of failing the operation.
        pub const NO_FAIL: i64 = 4;
        /// With `NO_FAIL`, commit the entries that succeed.
        pub const PARTIAL: i64 = 8;
    }

    /// Order and write flags applied when a put creates or changes a map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapPolicy {
        /// Order of a map the operation creates.
        pub order: MapOrder,
        /// Bitwise or of [`write_flags`].
        pub flags: i64,
    }

    /// Puts an entry into an unordered map.
    pub fn put(
        bin: &str,
        ctx: &[CdtContext],
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Operation {
        put_with_policy(&MapPolicy::default(), bin, ctx, key, value)
    }

    /// Puts an entry with the given order and write flags.
    pub fn put_with_policy(
        policy: &MapPolicy,
        bin: &str,
        ctx: &[CdtContext],
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Operation {
        let mut args = vec![key.into(), value.into(), Value::Int(policy.order as i64)];
        if policy.flags != write_flags::DEFAULT {
            args.push(Value::Int(policy.flags));
        }
        Operation::cdt(OperationType::CdtModify, bin, PUT, ctx, args)
    }

    /// Adds `incr` to the number at `key` and returns the result.
    pub fn increment(
        policy: &MapPolicy,
        bin: &str,
        ctx: &[CdtContext],
        key: impl Into<Value>,
        incr: impl Into<Value>,
    ) -> Operation {
        Operation::cdt(
            OperationType::CdtModify,
            bin,
            INCREMENT,
            ctx,
            vec![key.into(), incr.into(), Value::Int(policy.order as i64)],
        )
    }

    /// Removes every entry.
    pub fn clear(bin: &str, ctx: &[CdtContext]) -> Operation {
        Operation::cdt(OperationType::CdtModify, bin, CLEAR, ctx, Vec::new())
    }

    /// Removes an entry by key.
    pub fn remove_by_key(
        bin: &str,
        ctx: &[CdtContext],
        key: impl Into<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(OperationType::CdtModify, bin, REMOVE_BY_KEY, ctx, return_type, vec![key.into()])
    }

    /// Removes keys in `[begin, end)`.
    pub fn remove_by_key_range(
        bin: &str,
        ctx: &[CdtContext],
        begin: impl Into<Value>,
        end: Option<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(
            OperationType::CdtModify,
            bin,
            REMOVE_BY_KEY_INTERVAL,
            ctx,
            return_type,
            interval(begin.into(), end),
        )
    }

    /// Removes every entry whose value equals `value`.
    pub fn remove_by_value(
        bin: &str,
        ctx: &[CdtContext],
        value: impl Into<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(OperationType::CdtModify, bin, REMOVE_BY_VALUE, ctx, return_type, vec![value.into()])
    }

    /// Removes the entry with a value rank.
    pub fn remove_by_rank(bin: &str, ctx: &[CdtContext], rank: i64, return_type: ReturnType) -> Operation {
        selector(OperationType::CdtModify, bin, REMOVE_BY_RANK, ctx, return_type, vec![Value::Int(rank)])
    }

    /// Returns the entry count.
    pub fn size(bin: &str, ctx: &[CdtContext]) -> Operation {
        Operation::cdt(OperationType::CdtRead, bin, SIZE, ctx, Vec::new())
    }

    /// Selects an entry by key.
    pub fn get_by_key(
        bin: &str,
        ctx: &[CdtContext],
        key: impl Into<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(OperationType::CdtRead, bin, GET_BY_KEY, ctx, return_type, vec![key.into()])
    }

    /// Selects entries with keys in `[begin, end)`.
    pub fn get_by_key_range(
        bin: &str,
        ctx: &[CdtContext],
        begin: impl Into<Value>,
        end: Option<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(
            OperationType::CdtRead,
            bin,
            GET_BY_KEY_INTERVAL,
            ctx,
            return_type,
            interval(begin.into(), end),
        )
    }

    /// Selects the entry at a key index.
    pub fn get_by_index(bin: &str, ctx: &[CdtContext], index: i64, return_type: ReturnType) -> Operation {
        selector(OperationType::CdtRead, bin, GET_BY_INDEX, ctx, return_type, vec![Value::Int(index)])
    }

    /// Selects every entry whose value equals `value`.
    pub fn get_by_value(
        bin: &str,
        ctx: &[CdtContext],
        value: impl Into<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(OperationType::CdtRead, bin, GET_BY_VALUE, ctx, return_type, vec![value.into()])
    }

    /// Selects entries with values in `[begin, end)`.
    pub fn get_by_value_range(
        bin: &str,
        ctx: &[CdtContext],
        begin: impl Into<Value>,
        end: Option<Value>,
        return_type: ReturnType,
    ) -> Operation {
        selector(
            OperationType::CdtRead,
            bin,
            GET_BY_VALUE_INTERVAL,
            ctx,
            return_type,
            interval(begin.into(), end),
        )
    }

    /// Selects the entry with a value rank.
    pub fn get_by_rank(bin: &str, ctx: &[CdtContext], rank: i64, return_type: ReturnType) -> Operation {
        selector(OperationType::CdtRead, bin, GET_BY_RANK, ctx, return_type, vec![Value::Int(rank)])
    }

    /// Selects `count` entries starting at a value rank.
    pub fn get_by_rank_range(
        bin: &str,
        ctx: &[CdtContext],
        rank: i64,
        count: i64,
        return_type: ReturnType,
    ) -> Operation {
        selector(
            OperationType::CdtRead,
            bin,
            GET_BY_RANK_RANGE,
            ctx,
            return_type,
            vec![Value::Int(rank), Value::Int(count)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(op: &Operation) -> Vec<u8> {
        let mut out = BytesMut::new();
        op.write_to(&mut out).unwrap();
        assert_eq!(out.len(), op.estimate_size().unwrap());
        out.to_vec()
    }

    #[test]
    fn test_put_int_layout() {
        let bytes = encode(&Operation::put(Bin::new("a", 42)));
        assert_eq!(
            bytes,
            vec![0, 0, 0, 13, 2, 1, 0, 1, b'a', 0, 0, 0, 0, 0, 0, 0, 42]
        );
    }

    #[test]
    fn test_read_all_is_empty() {
        assert_eq!(encode(&Operation::get()), vec![0, 0, 0, 4, 1, 0, 0, 0]);
        assert!(Operation::get_header().is_header_only());
    }

    #[test]
    fn test_list_append_without_context() {
        let op = list::append("l", &[], 7);
        let bytes = encode(&op);
        assert_eq!(bytes[5], ParticleType::Blob as u8);
        assert_eq!(&bytes[9..], &[0x92, 0x01, 0x07]);
    }

    #[test]
    fn test_map_get_with_context() {
        let op = map::get_by_key("m", &[CdtContext::list_index(-1)], "k", ReturnType::Value);
        let bytes = encode(&op);
        assert_eq!(
            &bytes[9..],
            &[0x93, 0xcc, 0xff, 0x92, 0x10, 0xff, 0x93, 97, 0x07, 0xa2, 3, b'k']
        );
        assert!(!op.op_type.is_write());
    }

    fn payload(op: &Operation) -> Vec<u8> {
        let bytes = encode(op);
        bytes[8 + op.bin_name.len()..].to_vec()
    }

    #[test]
    fn test_list_selectors_lead_with_return_type() {
        assert_eq!(
            payload(&list::get_by_rank("l", &[], -1, ReturnType::Value)),
            vec![0x93, 21, 7, 0xff]
        );
        assert_eq!(
            payload(&list::get_by_index_range("l", &[], 1, 2, ReturnType::Count)),
            vec![0x94, 24, 5, 1, 2]
        );
        let remove = list::remove_by_value("l", &[], 9, ReturnType::None);
        assert_eq!(payload(&remove), vec![0x93, 35, 0, 9]);
        assert!(remove.op_type.is_write());
    }

    #[test]
    fn test_value_interval_without_end() {
        assert_eq!(
            payload(&list::get_by_value_range("l", &[], 10, None, ReturnType::Value)),
            vec![0x93, 25, 7, 10]
        );
        assert_eq!(
            payload(&map::get_by_value_range("m", &[], Value::Nil, Some(Value::Int(5)), ReturnType::Key)),
            vec![0x94, 105, 6, 0xc0, 5]
        );
    }

    #[test]
    fn test_list_increment_sort_and_policy() {
        assert_eq!(payload(&list::increment("l", &[], 2, 5)), vec![0x93, 12, 2, 5]);
        assert_eq!(
            payload(&list::sort("l", &[], list::sort_flags::DESCENDING | list::sort_flags::DROP_DUPLICATES)),
            vec![0x92, 13, 3]
        );
        let policy = list::ListPolicy {
            order: list::ListOrder::Ordered,
            flags: list::write_flags::ADD_UNIQUE | list::write_flags::NO_FAIL,
        };
        assert_eq!(
            payload(&list::append_with_policy(&policy, "l", &[], 4)),
            vec![0x94, 1, 4, 1, 5]
        );
    }

    #[test]
    fn test_map_put_flags_only_when_set() {
        assert_eq!(payload(&map::put("m", &[], 1, 2)), vec![0x94, 67, 1, 2, 0]);
        let policy = map::MapPolicy {
            order: map::MapOrder::KeyOrdered,
            flags: map::write_flags::CREATE_ONLY,
        };
        assert_eq!(
            payload(&map::put_with_policy(&policy, "m", &[], 1, 2)),
            vec![0x95, 67, 1, 2, 1, 1]
        );
        assert_eq!(
            payload(&map::increment(&policy, "m", &[], 1, 3)),
            vec![0x94, 73, 1, 3, 1]
        );
    }

    #[test]
    fn test_map_selectors() {
        assert_eq!(
            payload(&map::get_by_rank_range("m", &[], 0, 3, ReturnType::KeyValue)),
            vec![0x94, 106, 8, 0, 3]
        );
        assert_eq!(
            payload(&map::remove_by_key_range("m", &[], 1, Some(Value::Int(4)), ReturnType::Count)),
            vec![0x94, 84, 5, 1, 4]
        );
        assert!(!map::get_by_value("m", &[], 1, ReturnType::Key).op_type.is_write());
    }

    #[test]
    fn test_long_bin_name_rejected() {
        let op = Operation::get_bin("this_name_is_too_long");
        assert!(op.estimate_size().is_err());
    }
}
