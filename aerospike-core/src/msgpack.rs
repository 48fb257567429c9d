//! MsgPack encoding of list and map values.
//!
//! The server extends plain MsgPack in two ways: every string-family payload
//! starts with a particle type byte (so a `STRING` and a `BLOB` can both be
//! carried in a MsgPack `str`), and ordered CDT extrema are sent as ext type
//! `0xff` values.

use crate::error::{Error, Result};
use crate::protocol::ParticleType;
use crate::serialization::{BufferReader, DataInput, DataOutput};
use crate::value::Value;

const MAX_NESTING: usize = 64;

/// Packs a value.
pub fn pack_value(out: &mut dyn DataOutput, value: &Value) -> Result<()> {
    match value {
        Value::Nil => out.write_u8(0xc0),
        Value::Bool(b) => out.write_u8(if *b { 0xc3 } else { 0xc2 }),
        Value::Int(i) => pack_i64(out, *i),
        Value::Float(f) => {
            out.write_u8(0xcb)?;
            out.write_f64(*f)
        }
        Value::String(s) => pack_particle_bytes(out, ParticleType::String, s.as_bytes()),
        Value::Blob(b) => pack_particle_bytes(out, ParticleType::Blob, b),
        Value::GeoJson(s) => pack_particle_bytes(out, ParticleType::GeoJson, s.as_bytes()),
        Value::Hll(b) => pack_particle_bytes(out, ParticleType::Hll, b),
        Value::List(items) => {
            pack_array_begin(out, items.len())?;
            for item in items {
                pack_value(out, item)?;
            }
            Ok(())
        }
        Value::Map(entries) => {
            pack_map_begin(out, entries.len())?;
            for (k, v) in entries {
                pack_value(out, k)?;
                pack_value(out, v)?;
            }
            Ok(())
        }
        Value::Infinity => out.write_bytes(&[0xd4, 0xff, 0x01]),
        Value::Wildcard => out.write_bytes(&[0xd4, 0xff, 0x00]),
    }
}

/// Packs a signed integer using the smallest encoding.
pub fn pack_i64(out: &mut dyn DataOutput, v: i64) -> Result<()> {
    if v >= 0 {
        return pack_u64(out, v as u64);
    }
    if v >= -32 {
        out.write_u8(v as i8 as u8)
    } else if v >= i8::MIN as i64 {
        out.write_u8(0xd0)?;
        out.write_i8(v as i8)
    } else if v >= i16::MIN as i64 {
        out.write_u8(0xd1)?;
        out.write_i16(v as i16)
    } else if v >= i32::MIN as i64 {
        out.write_u8(0xd2)?;
        out.write_i32(v as i32)
    } else {
        out.write_u8(0xd3)?;
        out.write_i64(v)
    }
}

/// Packs an unsigned integer using the smallest encoding.
pub fn pack_u64(out: &mut dyn DataOutput, v: u64) -> Result<()> {
    if v < 0x80 {
        out.write_u8(v as u8)
    } else if v <= u8::MAX as u64 {
        out.write_u8(0xcc)?;
        out.write_u8(v as u8)
    } else if v <= u16::MAX as u64 {
        out.write_u8(0xcd)?;
        out.write_u16(v as u16)
    } else if v <= u32::MAX as u64 {
        out.write_u8(0xce)?;
        out.write_u32(v as u32)
    } else {
        out.write_u8(0xcf)?;
        out.write_u64(v)
    }
}

/// Writes an array header.
pub fn pack_array_begin(out: &mut dyn DataOutput, len: usize) -> Result<()> {
    if len < 16 {
        out.write_u8(0x90 | len as u8)
    } else if len <= u16::MAX as usize {
        out.write_u8(0xdc)?;
        out.write_u16(len as u16)
    } else {
        out.write_u8(0xdd)?;
        out.write_u32(checked_u32(len)?)
    }
}

/// Writes a map header.
pub fn pack_map_begin(out: &mut dyn DataOutput, len: usize) -> Result<()> {
    if len < 16 {
        out.write_u8(0x80 | len as u8)
    } else if len <= u16::MAX as usize {
        out.write_u8(0xde)?;
        out.write_u16(len as u16)
    } else {
        out.write_u8(0xdf)?;
        out.write_u32(checked_u32(len)?)
    }
}

/// Packs a string without the particle type prefix.
///
/// Used where the server expects plain MsgPack text, such as regex patterns.
pub fn pack_raw_string(out: &mut dyn DataOutput, s: &str) -> Result<()> {
    pack_str_header(out, s.len())?;
    out.write_bytes(s.as_bytes())
}

fn pack_particle_bytes(out: &mut dyn DataOutput, ptype: ParticleType, data: &[u8]) -> Result<()> {
    pack_str_header(out, data.len() + 1)?;
    out.write_u8(ptype as u8)?;
    out.write_bytes(data)
}

// str8 (0xd9) is not emitted; older servers only read the 16 and 32 bit forms.
fn pack_str_header(out: &mut dyn DataOutput, len: usize) -> Result<()> {
    if len < 32 {
        out.write_u8(0xa0 | len as u8)
    } else if len <= u16::MAX as usize {
        out.write_u8(0xda)?;
        out.write_u16(len as u16)
    } else {
        out.write_u8(0xdb)?;
        out.write_u32(checked_u32(len)?)
    }
}

fn checked_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        Error::Serialization(format!("collection too large for MsgPack: {}", len))
    })
}

/// Unpacks one value.
pub fn unpack_value(input: &mut BufferReader<'_>) -> Result<Value> {
    unpack_nested(input, 0)
}

fn unpack_nested(input: &mut BufferReader<'_>, depth: usize) -> Result<Value> {
    if depth > MAX_NESTING {
        return Err(Error::Serialization(format!(
            "MsgPack nesting deeper than {}",
            MAX_NESTING
        )));
    }

    let marker = input.read_u8()?;
    match marker {
        0x00..=0x7f => Ok(Value::Int(marker as i64)),
        0x80..=0x8f => unpack_map(input, (marker & 0x0f) as usize, depth),
        0x90..=0x9f => unpack_list(input, (marker & 0x0f) as usize, depth),
        0xa0..=0xbf => unpack_particle_bytes(input, (marker & 0x1f) as usize),
        0xc0 => Ok(Value::Nil),
        0xc2 => Ok(Value::Bool(false)),
        0xc3 => Ok(Value::Bool(true)),
        0xc4 => {
            let len = input.read_u8()? as usize;
            Ok(Value::Blob(input.read_bytes(len)?))
        }
        0xc5 => {
            let len = input.read_u16()? as usize;
            Ok(Value::Blob(input.read_bytes(len)?))
        }
        0xc6 => {
            let len = input.read_u32()? as usize;
            Ok(Value::Blob(input.read_bytes(len)?))
        }
        0xc7 => {
            let len = input.read_u8()? as usize;
            unpack_ext(input, len)
        }
        0xc8 => {
            let len = input.read_u16()? as usize;
            unpack_ext(input, len)
        }
        0xc9 => {
            let len = input.read_u32()? as usize;
            unpack_ext(input, len)
        }
        0xca => Ok(Value::Float(f32::from_bits(input.read_u32()?) as f64)),
        0xcb => Ok(Value::Float(input.read_f64()?)),
        0xcc => Ok(Value::Int(input.read_u8()? as i64)),
        0xcd => Ok(Value::Int(input.read_u16()? as i64)),
        0xce => Ok(Value::Int(input.read_u32()? as i64)),
        0xcf => Ok(Value::Int(input.read_u64()? as i64)),
        0xd0 => Ok(Value::Int(input.read_i8()? as i64)),
        0xd1 => Ok(Value::Int(input.read_i16()? as i64)),
        0xd2 => Ok(Value::Int(input.read_i32()? as i64)),
        0xd3 => Ok(Value::Int(input.read_i64()?)),
        0xd4 => unpack_ext(input, 1),
        0xd5 => unpack_ext(input, 2),
        0xd6 => unpack_ext(input, 4),
        0xd7 => unpack_ext(input, 8),
        0xd8 => unpack_ext(input, 16),
        0xd9 => {
            let len = input.read_u8()? as usize;
            unpack_particle_bytes(input, len)
        }
        0xda => {
            let len = input.read_u16()? as usize;
            unpack_particle_bytes(input, len)
        }
        0xdb => {
            let len = input.read_u32()? as usize;
            unpack_particle_bytes(input, len)
        }
        0xdc => {
            let len = input.read_u16()? as usize;
            unpack_list(input, len, depth)
        }
        0xdd => {
            let len = input.read_u32()? as usize;
            unpack_list(input, len, depth)
        }
        0xde => {
            let len = input.read_u16()? as usize;
            unpack_map(input, len, depth)
        }
        0xdf => {
            let len = input.read_u32()? as usize;
            unpack_map(input, len, depth)
        }
        0xe0..=0xff => Ok(Value::Int(marker as i8 as i64)),
        0xc1 => Err(Error::Serialization(
            "reserved MsgPack marker 0xc1".to_string(),
        )),
    }
}

fn unpack_list(input: &mut BufferReader<'_>, count: usize, depth: usize) -> Result<Value> {
    // Every element takes at least one byte.
    let mut items = Vec::with_capacity(count.min(input.remaining()));
    for _ in 0..count {
        items.push(unpack_nested(input, depth + 1)?);
    }
    Ok(Value::List(items))
}

fn unpack_map(input: &mut BufferReader<'_>, count: usize, depth: usize) -> Result<Value> {
    let mut remaining = count;
    // An ordered map starts with an ext-keyed entry carrying the order flags.
    if remaining > 0 && is_ext_marker(input.peek_u8()?) {
        unpack_nested(input, depth + 1)?;
        unpack_nested(input, depth + 1)?;
        remaining -= 1;
    }

    let mut entries = Vec::with_capacity(remaining.min(input.remaining() / 2));
    for _ in 0..remaining {
        let key = unpack_nested(input, depth + 1)?;
        let value = unpack_nested(input, depth + 1)?;
        entries.push((key, value));
    }
    Ok(Value::Map(entries))
}

fn is_ext_marker(marker: u8) -> bool {
    matches!(marker, 0xc7..=0xc9 | 0xd4..=0xd8)
}

fn unpack_ext(input: &mut BufferReader<'_>, len: usize) -> Result<Value> {
    let ext_type = input.read_u8()?;
    let data = input.read_slice(len)?;
    if ext_type == 0xff && len == 1 {
        return Ok(match data[0] {
            0x01 => Value::Infinity,
            _ => Value::Wildcard,
        });
    }
    Ok(Value::Nil)
}

fn unpack_particle_bytes(input: &mut BufferReader<'_>, len: usize) -> Result<Value> {
    if len == 0 {
        return Ok(Value::String(String::new()));
    }
    let ptype = input.read_u8()?;
    let data = input.read_slice(len - 1)?;
    match ParticleType::from_u8(ptype) {
        Some(ParticleType::String) => utf8(data).map(Value::String),
        Some(ParticleType::GeoJson) => utf8(data).map(Value::GeoJson),
        Some(ParticleType::Hll) => Ok(Value::Hll(data.to_vec())),
        _ => Ok(Value::Blob(data.to_vec())),
    }
}

fn utf8(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| Error::Serialization(format!("invalid UTF-8 in MsgPack string: {}", e)))
}
