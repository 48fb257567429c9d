//! Mapping between caller types and bin values.
//!
//! Types describe themselves through [`Serializable`], which drives a
//! [`SerializationWriter`]. The writer shipped here, [`ValueWriter`], builds a
//! [`Value`] tree that becomes bins of a record. Replies go the other way:
//! a [`ParseNode`] wraps a value or a record and [`Parsable`] types pull
//! their fields out of it.

use crate::bin::Bin;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::value::Value;

/// Receives the fields of a [`Serializable`] value.
///
/// A `key` names a field of the enclosing object; `None` writes an element
/// of the enclosing collection or the top-level value.
pub trait SerializationWriter {
    /// Writes a string.
    fn write_string_value(&mut self, key: Option<&str>, value: &str) -> Result<()>;

    /// Writes a boolean.
    fn write_bool_value(&mut self, key: Option<&str>, value: bool) -> Result<()>;

    /// Writes a signed integer.
    fn write_int64_value(&mut self, key: Option<&str>, value: i64) -> Result<()>;

    /// Writes a float.
    fn write_float64_value(&mut self, key: Option<&str>, value: f64) -> Result<()>;

    /// Writes raw bytes.
    fn write_bytes_value(&mut self, key: Option<&str>, value: &[u8]) -> Result<()>;

    /// Writes an explicit null.
    fn write_null_value(&mut self, key: Option<&str>) -> Result<()>;

    /// Writes a nested object.
    fn write_object_value(&mut self, key: Option<&str>, value: &dyn Serializable) -> Result<()>;

    /// Writes a collection of nested objects.
    fn write_collection_of_object_values(
        &mut self,
        key: Option<&str>,
        values: &[&dyn Serializable],
    ) -> Result<()>;
}

/// Types that can be written as bin values.
pub trait Serializable {
    /// Writes this value to the writer.
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()>;
}

/// A node of a reply that typed values are read from.
pub trait ParseNode {
    /// Returns the node as a string.
    fn get_string(&self) -> Option<String>;

    /// Returns the node as an integer.
    fn get_int64(&self) -> Option<i64>;

    /// Returns the node as a float.
    fn get_float64(&self) -> Option<f64>;

    /// Returns the node as a boolean.
    fn get_bool(&self) -> Option<bool>;

    /// Returns the node as bytes.
    fn get_bytes(&self) -> Option<Vec<u8>>;

    /// Returns true if the node holds no value.
    fn is_nil(&self) -> bool;

    /// Returns a named child.
    fn get_child_node(&self, name: &str) -> Option<Box<dyn ParseNode + '_>>;

    /// Returns the elements of a collection node.
    fn get_collection(&self) -> Vec<Box<dyn ParseNode + '_>>;
}

/// Types that can be read from a [`ParseNode`].
pub trait Parsable: Sized {
    /// Reads a value from the node.
    fn parse(node: &dyn ParseNode) -> Result<Self>;
}

/// Builds a [`Value`] from the calls made by a [`Serializable`].
#[derive(Debug, Default)]
pub struct ValueWriter {
    entries: Vec<(Value, Value)>,
    items: Vec<Value>,
}

impl ValueWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: Option<&str>, value: Value) -> Result<()> {
        match key {
            Some(k) => self.entries.push((Value::from(k), value)),
            None => self.items.push(value),
        }
        Ok(())
    }

    /// Returns the value written so far.
    ///
    /// Named fields form a map; a single unnamed write is returned as is.
    pub fn into_value(self) -> Result<Value> {
        match (self.entries.is_empty(), self.items.len()) {
            (true, 0) => Ok(Value::Nil),
            (true, 1) => Ok(self.items.into_iter().next().unwrap_or(Value::Nil)),
            (false, 0) => Ok(Value::Map(self.entries)),
            (true, n) => Err(Error::InvalidArgument(format!(
                "{} unnamed values written outside a collection",
                n
            ))),
            (false, _) => Err(Error::InvalidArgument(
                "named and unnamed values mixed in one object".to_string(),
            )),
        }
    }
}

impl SerializationWriter for ValueWriter {
    fn write_string_value(&mut self, key: Option<&str>, value: &str) -> Result<()> {
        self.push(key, Value::from(value))
    }

    fn write_bool_value(&mut self, key: Option<&str>, value: bool) -> Result<()> {
        self.push(key, Value::Bool(value))
    }

    fn write_int64_value(&mut self, key: Option<&str>, value: i64) -> Result<()> {
        self.push(key, Value::Int(value))
    }

    fn write_float64_value(&mut self, key: Option<&str>, value: f64) -> Result<()> {
        self.push(key, Value::Float(value))
    }

    fn write_bytes_value(&mut self, key: Option<&str>, value: &[u8]) -> Result<()> {
        self.push(key, Value::Blob(value.to_vec()))
    }

    fn write_null_value(&mut self, key: Option<&str>) -> Result<()> {
        self.push(key, Value::Nil)
    }

    fn write_object_value(&mut self, key: Option<&str>, value: &dyn Serializable) -> Result<()> {
        let nested = to_value(value)?;
        self.push(key, nested)
    }

    fn write_collection_of_object_values(
        &mut self,
        key: Option<&str>,
        values: &[&dyn Serializable],
    ) -> Result<()> {
        let items = values
            .iter()
            .map(|v| to_value(*v))
            .collect::<Result<Vec<_>>>()?;
        self.push(key, Value::List(items))
    }
}

/// Serializes a value into a [`Value`] tree.
pub fn to_value(value: &dyn Serializable) -> Result<Value> {
    let mut writer = ValueWriter::new();
    value.serialize(&mut writer)?;
    writer.into_value()
}

/// Serializes an object into bins, one per named field.
pub fn to_bins(value: &dyn Serializable) -> Result<Vec<Bin>> {
    match to_value(value)? {
        Value::Map(entries) => entries
            .into_iter()
            .map(|(k, v)| match k {
                Value::String(name) => Ok(Bin::new(name, v)),
                other => Err(Error::InvalidArgument(format!(
                    "bin name must be a string, got {}",
                    other
                ))),
            })
            .collect(),
        other => Err(Error::InvalidArgument(format!(
            "only objects with named fields map to bins, got {}",
            other
        ))),
    }
}

/// A [`ParseNode`] over a single value.
#[derive(Debug, Clone, Copy)]
pub struct ValueParseNode<'a> {
    value: &'a Value,
}

impl<'a> ValueParseNode<'a> {
    /// Wraps a value.
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }
}

impl ParseNode for ValueParseNode<'_> {
    fn get_string(&self) -> Option<String> {
        self.value.as_str().map(str::to_string)
    }

    fn get_int64(&self) -> Option<i64> {
        self.value.as_int()
    }

    fn get_float64(&self) -> Option<f64> {
        match self.value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    fn get_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    fn get_bytes(&self) -> Option<Vec<u8>> {
        self.value.as_bytes().map(<[u8]>::to_vec)
    }

    fn is_nil(&self) -> bool {
        self.value.is_nil()
    }

    fn get_child_node(&self, name: &str) -> Option<Box<dyn ParseNode + '_>> {
        self.value.map_get(name).map(boxed)
    }

    fn get_collection(&self) -> Vec<Box<dyn ParseNode + '_>> {
        self.value
            .as_list()
            .map(|items| items.iter().map(boxed).collect())
            .unwrap_or_default()
    }
}

fn boxed(value: &Value) -> Box<dyn ParseNode + '_> {
    Box::new(ValueParseNode::new(value))
}

/// A [`ParseNode`] over a record; children are its bins.
#[derive(Debug, Clone, Copy)]
pub struct RecordParseNode<'a> {
    record: &'a Record,
}

impl<'a> RecordParseNode<'a> {
    /// Wraps a record.
    pub fn new(record: &'a Record) -> Self {
        Self { record }
    }
}

impl ParseNode for RecordParseNode<'_> {
    fn get_string(&self) -> Option<String> {
        None
    }

    fn get_int64(&self) -> Option<i64> {
        None
    }

    fn get_float64(&self) -> Option<f64> {
        None
    }

    fn get_bool(&self) -> Option<bool> {
        None
    }

    fn get_bytes(&self) -> Option<Vec<u8>> {
        None
    }

    fn is_nil(&self) -> bool {
        self.record.bins.is_empty()
    }

    fn get_child_node(&self, name: &str) -> Option<Box<dyn ParseNode + '_>> {
        self.record.bins.get(name).map(boxed)
    }

    fn get_collection(&self) -> Vec<Box<dyn ParseNode + '_>> {
        Vec::new()
    }
}

/// Reads a child field. A missing field parses as nil, so only optional
/// targets accept it.
pub fn parse_field<T: Parsable>(node: &dyn ParseNode, name: &str) -> Result<T> {
    match node.get_child_node(name) {
        Some(child) => T::parse(child.as_ref()),
        None => T::parse(&ValueParseNode::new(&Value::Nil))
            .map_err(|_| Error::Serialization(format!("missing field `{}`", name))),
    }
}

fn type_mismatch(expected: &str) -> Error {
    Error::Serialization(format!("expected {}", expected))
}

impl Serializable for i64 {
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
        writer.write_int64_value(None, *self)
    }
}

impl Parsable for i64 {
    fn parse(node: &dyn ParseNode) -> Result<Self> {
        node.get_int64().ok_or_else(|| type_mismatch("integer"))
    }
}

impl Serializable for i32 {
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
        writer.write_int64_value(None, *self as i64)
    }
}

impl Parsable for i32 {
    fn parse(node: &dyn ParseNode) -> Result<Self> {
        let v = i64::parse(node)?;
        i32::try_from(v).map_err(|_| Error::Serialization(format!("{} overflows i32", v)))
    }
}

impl Serializable for f64 {
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
        writer.write_float64_value(None, *self)
    }
}

impl Parsable for f64 {
    fn parse(node: &dyn ParseNode) -> Result<Self> {
        node.get_float64().ok_or_else(|| type_mismatch("float"))
    }
}

impl Serializable for bool {
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
        writer.write_bool_value(None, *self)
    }
}

impl Parsable for bool {
    fn parse(node: &dyn ParseNode) -> Result<Self> {
        node.get_bool().ok_or_else(|| type_mismatch("boolean"))
    }
}

impl Serializable for String {
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
        writer.write_string_value(None, self)
    }
}

impl Serializable for str {
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
        writer.write_string_value(None, self)
    }
}

impl Parsable for String {
    fn parse(node: &dyn ParseNode) -> Result<Self> {
        node.get_string().ok_or_else(|| type_mismatch("string"))
    }
}

impl Serializable for Vec<u8> {
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
        writer.write_bytes_value(None, self)
    }
}

impl Parsable for Vec<u8> {
    fn parse(node: &dyn ParseNode) -> Result<Self> {
        node.get_bytes().ok_or_else(|| type_mismatch("bytes"))
    }
}

impl<T: Serializable> Serializable for Option<T> {
    fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
        match self {
            Some(v) => v.serialize(writer),
            None => writer.write_null_value(None),
        }
    }
}

impl<T: Parsable> Parsable for Option<T> {
    fn parse(node: &dyn ParseNode) -> Result<Self> {
        if node.is_nil() {
            Ok(None)
        } else {
            T::parse(node).map(Some)
        }
    }
}

impl<T: Parsable> Parsable for Vec<T> {
    fn parse(node: &dyn ParseNode) -> Result<Self> {
        node.get_collection()
            .iter()
            .map(|child| T::parse(child.as_ref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, PartialEq)]
    struct Address {
        city: String,
    }

    impl Serializable for Address {
        fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
            writer.write_string_value(Some("city"), &self.city)
        }
    }

    impl Parsable for Address {
        fn parse(node: &dyn ParseNode) -> Result<Self> {
            Ok(Self {
                city: parse_field(node, "city")?,
            })
        }
    }

    #[derive(Debug, PartialEq)]
    struct Person {
        name: String,
        age: i64,
        nickname: Option<String>,
        addresses: Vec<Address>,
    }

    impl Serializable for Person {
        fn serialize(&self, writer: &mut dyn SerializationWriter) -> Result<()> {
            writer.write_string_value(Some("name"), &self.name)?;
            writer.write_int64_value(Some("age"), self.age)?;
            writer.write_object_value(Some("nickname"), &self.nickname)?;
            let addresses: Vec<&dyn Serializable> =
                self.addresses.iter().map(|a| a as &dyn Serializable).collect();
            writer.write_collection_of_object_values(Some("addresses"), &addresses)
        }
    }

    impl Parsable for Person {
        fn parse(node: &dyn ParseNode) -> Result<Self> {
            Ok(Self {
                name: parse_field(node, "name")?,
                age: parse_field(node, "age")?,
                nickname: parse_field(node, "nickname")?,
                addresses: parse_field(node, "addresses")?,
            })
        }
    }

    fn person() -> Person {
        Person {
            name: "Ada".to_string(),
            age: 36,
            nickname: None,
            addresses: vec![Address {
                city: "London".to_string(),
            }],
        }
    }

    #[test]
    fn test_object_to_bins() {
        let bins = to_bins(&person()).unwrap();
        let names: Vec<_> = bins.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["name", "age", "nickname", "addresses"]);
        assert_eq!(bins[1].value, Value::Int(36));
        assert_eq!(bins[2].value, Value::Nil);
    }

    #[test]
    fn test_record_parses_back() {
        let bins: HashMap<String, Value> = to_bins(&person())
            .unwrap()
            .into_iter()
            .map(|b| (b.name, b.value))
            .collect();
        let record = Record::new(None, bins, 1, 0);
        let parsed = Person::parse(&RecordParseNode::new(&record)).unwrap();
        assert_eq!(parsed, person());
    }

    #[test]
    fn test_missing_field() {
        let record = Record::new(None, HashMap::new(), 1, 0);
        let err = Address::parse(&RecordParseNode::new(&record)).unwrap_err();
        assert!(err.to_string().contains("missing field `city`"));
    }

    #[test]
    fn test_primitive_is_not_bins() {
        assert!(to_bins(&42i64).is_err());
        assert_eq!(to_value(&42i64).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_mixed_named_and_unnamed_rejected() {
        let mut writer = ValueWriter::new();
        writer.write_int64_value(Some("a"), 1).unwrap();
        writer.write_int64_value(None, 2).unwrap();
        assert!(writer.into_value().is_err());
    }
}
