//! Record keys and their RIPEMD-160 digests.

use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::BytesMut;
use ripemd::{Digest, Ripemd160};

use crate::error::{Error, Result};
use crate::msgpack;
use crate::protocol::{DIGEST_SIZE, PARTITIONS};
use crate::result_code::ResultCode;
use crate::value::Value;

/// Identifies a record.
///
/// The digest is computed once at construction; two keys are equal when
/// their digests are equal, whatever their namespace or user key.
#[derive(Debug, Clone)]
pub struct Key {
    namespace: String,
    set_name: String,
    user_key: Option<Value>,
    digest: [u8; DIGEST_SIZE],
}

impl Key {
    /// Creates a key and computes its digest.
    pub fn new(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        user_key: impl Into<Value>,
    ) -> Result<Self> {
        let set_name = set_name.into();
        let user_key = user_key.into();
        let digest = compute_digest(&set_name, &user_key)?;
        Ok(Self {
            namespace: namespace.into(),
            set_name,
            user_key: Some(user_key),
            digest,
        })
    }

    /// Creates a key from a digest already known to the caller.
    pub fn with_digest(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        digest: [u8; DIGEST_SIZE],
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            user_key: None,
            digest,
        }
    }

    /// Namespace name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Set name; empty when the record is not in a set.
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// User key, if known.
    pub fn user_key(&self) -> Option<&Value> {
        self.user_key.as_ref()
    }

    /// Record digest.
    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// Returns the partition owning this key, in `0..4096`.
    pub fn partition_id(&self) -> usize {
        partition_id(&self.digest)
    }

    /// Attaches the user key returned alongside a digest in a reply.
    pub fn with_user_key(mut self, user_key: Option<Value>) -> Self {
        self.user_key = user_key;
        self
    }
}

/// Maps a digest to its partition: the low 12 bits of the first two bytes
/// read as little-endian.
pub fn partition_id(digest: &[u8; DIGEST_SIZE]) -> usize {
    u16::from_le_bytes([digest[0], digest[1]]) as usize % PARTITIONS
}

/// Computes RIPEMD-160 over the set name, the key particle type and the
/// key bytes.
pub fn compute_digest(set_name: &str, user_key: &Value) -> Result<[u8; DIGEST_SIZE]> {
    let mut hasher = Ripemd160::new();
    hasher.update(set_name.as_bytes());
    hasher.update([user_key.particle_type() as u8]);

    match user_key {
        Value::Int(i) => hasher.update(i.to_be_bytes()),
        Value::String(s) => hasher.update(s.as_bytes()),
        Value::Blob(b) => hasher.update(b),
        Value::List(_) | Value::Map(_) => {
            let mut packed = BytesMut::new();
            msgpack::pack_value(&mut packed, user_key)?;
            hasher.update(&packed);
        }
        other => {
            return Err(Error::client(
                ResultCode::TypeNotSupported,
                format!("unsupported key type: {:?}", other.particle_type()),
            ))
        }
    }

    Ok(hasher.finalize().into())
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.namespace, self.set_name)?;
        match &self.user_key {
            Some(v) => write!(f, "{}:", v)?,
            None => write!(f, "<digest>:")?,
        }
        for b in &self.digest {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(digest: &[u8]) -> String {
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_string_key_digest() {
        let key = Key::new("ns1", "s1", "alpha").unwrap();
        assert_eq!(hex(key.digest()), "ed8b7cb5404f7f5e79e68cbbd84ae35ea7baa479");
    }

    #[test]
    fn test_integer_key_digest() {
        let key = Key::new("test", "", 1i64).unwrap();
        assert_eq!(hex(key.digest()), "a443f05d05d962202b59abb402afae1737dbf66a");
    }

    #[test]
    fn test_partition_id_in_range() {
        for i in 0..500i64 {
            let key = Key::new("test", "demo", i).unwrap();
            assert!(key.partition_id() < PARTITIONS);
        }
    }

    #[test]
    fn test_partition_id_low_twelve_bits() {
        let mut digest = [0u8; DIGEST_SIZE];
        digest[0] = 0x34;
        digest[1] = 0xF2;
        assert_eq!(partition_id(&digest), 0x234);
    }

    #[test]
    fn test_equality_by_digest() {
        let a = Key::new("ns", "set", "k").unwrap();
        let b = Key::with_digest("other", "set", *a.digest());
        assert_eq!(a, b);
        assert_ne!(a, Key::new("ns", "set", "j").unwrap());
    }

    #[test]
    fn test_float_key_rejected() {
        let err = Key::new("ns", "set", 1.5).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::TypeNotSupported);
    }
}
