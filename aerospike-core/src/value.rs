//! Particle values stored in bins.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::msgpack;
use crate::protocol::ParticleType;
use crate::serialization::{BufferReader, DataInput, DataOutput, SizeCounter};

/// A bin value.
///
/// `Infinity` and `Wildcard` are only meaningful inside ordered CDT range
/// arguments and cannot be stored in a bin.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Empty value; writing it to a bin deletes the bin.
    Nil,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Blob(Vec<u8>),
    /// Ordered list.
    List(Vec<Value>),
    /// Map as key/value pairs in insertion order.
    Map(Vec<(Value, Value)>),
    /// GeoJSON document.
    GeoJson(String),
    /// HyperLogLog sketch.
    Hll(Vec<u8>),
    /// Sorts above every other value.
    Infinity,
    /// Matches any value.
    Wildcard,
}

impl Value {
    /// Returns the particle type used on the wire.
    pub fn particle_type(&self) -> ParticleType {
        match self {
            Value::Nil | Value::Infinity | Value::Wildcard => ParticleType::Null,
            Value::Bool(_) => ParticleType::Bool,
            Value::Int(_) => ParticleType::Integer,
            Value::Float(_) => ParticleType::Float,
            Value::String(_) => ParticleType::String,
            Value::Blob(_) => ParticleType::Blob,
            Value::List(_) => ParticleType::List,
            Value::Map(_) => ParticleType::Map,
            Value::GeoJson(_) => ParticleType::GeoJson,
            Value::Hll(_) => ParticleType::Hll,
        }
    }

    /// Returns the number of bytes `write_to` produces.
    pub fn estimate_size(&self) -> Result<usize> {
        match self {
            Value::Nil => Ok(0),
            Value::Bool(_) => Ok(1),
            Value::Int(_) | Value::Float(_) => Ok(8),
            Value::String(s) => Ok(s.len()),
            Value::Blob(b) | Value::Hll(b) => Ok(b.len()),
            Value::GeoJson(s) => Ok(3 + s.len()),
            Value::List(_) | Value::Map(_) => {
                let mut counter = SizeCounter::new();
                msgpack::pack_value(&mut counter, self)?;
                Ok(counter.count())
            }
            Value::Infinity | Value::Wildcard => Err(Error::client(
                crate::ResultCode::TypeNotSupported,
                "infinity and wildcard cannot be stored in a bin",
            )),
        }
    }

    /// Writes the bin representation of this value.
    pub fn write_to(&self, out: &mut dyn DataOutput) -> Result<()> {
        match self {
            Value::Nil => Ok(()),
            Value::Bool(b) => out.write_u8(*b as u8),
            Value::Int(i) => out.write_i64(*i),
            Value::Float(f) => out.write_f64(*f),
            Value::String(s) => out.write_bytes(s.as_bytes()),
            Value::Blob(b) | Value::Hll(b) => out.write_bytes(b),
            Value::GeoJson(s) => {
                out.write_u8(0)?;
                out.write_u16(0)?;
                out.write_bytes(s.as_bytes())
            }
            Value::List(_) | Value::Map(_) => msgpack::pack_value(out, self),
            Value::Infinity | Value::Wildcard => Err(Error::client(
                crate::ResultCode::TypeNotSupported,
                "infinity and wildcard cannot be stored in a bin",
            )),
        }
    }

    /// Decodes a bin value from its particle type and bytes.
    pub fn from_particle(particle_type: u8, data: &[u8]) -> Result<Value> {
        let ptype = ParticleType::from_u8(particle_type).ok_or_else(|| {
            Error::Protocol(format!("unknown particle type: {}", particle_type))
        })?;

        match ptype {
            ParticleType::Null => Ok(Value::Nil),
            ParticleType::Integer => Ok(Value::Int(bytes_to_i64(data)?)),
            ParticleType::Float => {
                if data.len() != 8 {
                    return Err(Error::Protocol(format!(
                        "float particle must be 8 bytes, got {}",
                        data.len()
                    )));
                }
                BufferReader::new(data).read_f64().map(Value::Float)
            }
            ParticleType::Bool => Ok(Value::Bool(data.first().copied().unwrap_or(0) != 0)),
            ParticleType::String => String::from_utf8(data.to_vec())
                .map(Value::String)
                .map_err(|e| Error::Serialization(format!("invalid UTF-8 string: {}", e))),
            ParticleType::Blob => Ok(Value::Blob(data.to_vec())),
            ParticleType::Hll => Ok(Value::Hll(data.to_vec())),
            ParticleType::GeoJson => parse_geojson(data),
            ParticleType::List | ParticleType::Map => {
                msgpack::unpack_value(&mut BufferReader::new(data))
            }
            ParticleType::Ldt => Err(Error::Protocol(
                "large data types are not supported".to_string(),
            )),
        }
    }

    /// Returns true for `Nil`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns the integer if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float if this is a `Float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the string if this is a `String` or `GeoJson`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::GeoJson(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bytes if this is a `Blob` or `Hll`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) | Value::Hll(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the elements if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the entries if this is a `Map`.
    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Looks up a map entry by string key.
    pub fn map_get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

/// Decodes a big-endian signed integer of up to 8 bytes.
fn bytes_to_i64(data: &[u8]) -> Result<i64> {
    if data.is_empty() || data.len() > 8 {
        return Err(Error::Protocol(format!(
            "integer particle must be 1 to 8 bytes, got {}",
            data.len()
        )));
    }
    let fill = if data[0] & 0x80 != 0 { 0xFF } else { 0 };
    let mut raw = [fill; 8];
    raw[8 - data.len()..].copy_from_slice(data);
    Ok(i64::from_be_bytes(raw))
}

fn parse_geojson(data: &[u8]) -> Result<Value> {
    let mut input = BufferReader::new(data);
    input.skip(1)?;
    let ncells = input.read_u16()? as usize;
    input.skip(ncells * 8)?;
    let json = input.read_slice(input.remaining())?;
    String::from_utf8(json.to_vec())
        .map(Value::GeoJson)
        .map_err(|e| Error::Serialization(format!("invalid GeoJSON text: {}", e)))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "<null>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::GeoJson(s) => write!(f, "GeoJSON({})", s),
            Value::Blob(b) => write!(f, "Blob({} bytes)", b.len()),
            Value::Hll(b) => write!(f, "HLL({} bytes)", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Infinity => write!(f, "INF"),
            Value::Wildcard => write!(f, "*"),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(v as i64)
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32, isize);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::String(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<V: Into<Value>> From<HashMap<String, V>> for Value {
    fn from(v: HashMap<String, V>) -> Self {
        Value::Map(
            v.into_iter()
                .map(|(k, v)| (Value::String(k), v.into()))
                .collect(),
        )
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(value: &Value) -> Vec<u8> {
        let mut out = BytesMut::new();
        value.write_to(&mut out).unwrap();
        assert_eq!(out.len(), value.estimate_size().unwrap());
        out.to_vec()
    }

    #[test]
    fn test_int_is_eight_bytes_big_endian() {
        assert_eq!(encode(&Value::Int(42)), vec![0, 0, 0, 0, 0, 0, 0, 0x2A]);
    }

    #[test]
    fn test_short_integer_particle_sign_extends() {
        assert_eq!(Value::from_particle(1, &[0xFF, 0xFE]).unwrap(), Value::Int(-2));
        assert_eq!(Value::from_particle(1, &[0x01, 0x00]).unwrap(), Value::Int(256));
    }

    #[test]
    fn test_geojson_layout() {
        let geo = Value::GeoJson(r#"{"type":"Point","coordinates":[1,2]}"#.to_string());
        let bytes = encode(&geo);
        assert_eq!(&bytes[..3], &[0, 0, 0]);
        assert_eq!(Value::from_particle(23, &bytes).unwrap(), geo);
    }

    #[test]
    fn test_geojson_skips_cells() {
        let mut data = vec![0u8, 0, 1];
        data.extend_from_slice(&[9; 8]);
        data.extend_from_slice(b"{}");
        assert_eq!(
            Value::from_particle(23, &data).unwrap(),
            Value::GeoJson("{}".to_string())
        );
    }

    #[test]
    fn test_list_particle_decodes() {
        let list = Value::List(vec![Value::Int(1), Value::from("a"), Value::Float(2.5)]);
        let bytes = encode(&list);
        assert_eq!(Value::from_particle(20, &bytes).unwrap(), list);
    }

    #[test]
    fn test_unknown_particle_type_fails() {
        let err = Value::from_particle(99, &[]).unwrap_err();
        assert!(err.to_string().contains("unknown particle type"));
    }

    #[test]
    fn test_infinity_not_storable() {
        assert!(Value::Infinity.estimate_size().is_err());
    }

    #[test]
    fn test_map_get() {
        let map = Value::Map(vec![(Value::from("k"), Value::from(7))]);
        assert_eq!(map.map_get("k"), Some(&Value::Int(7)));
        assert_eq!(map.map_get("x"), None);
    }

    #[test]
    fn test_display() {
        let list = Value::List(vec![Value::Int(1), Value::from("x")]);
        assert_eq!(list.to_string(), "[1, x]");
        assert_eq!(Value::Nil.to_string(), "<null>");
    }
}
