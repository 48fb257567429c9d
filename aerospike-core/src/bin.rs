//! Named bin values.

use crate::error::{Error, Result};
use crate::result_code::ResultCode;
use crate::value::Value;

/// Longest bin name the server accepts.
pub const MAX_BIN_NAME_LENGTH: usize = 15;

/// A bin name and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    /// Bin name.
    pub name: String,
    /// Bin value; `Nil` removes the bin on write.
    pub value: Value,
}

impl Bin {
    /// Creates a bin.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Rejects bin names the server would refuse.
pub fn validate_bin_name(name: &str) -> Result<()> {
    if name.len() > MAX_BIN_NAME_LENGTH {
        return Err(Error::client(
            ResultCode::BinNameTooLong,
            format!(
                "bin name `{}` is {} bytes, limit is {}",
                name,
                name.len(),
                MAX_BIN_NAME_LENGTH
            ),
        ));
    }
    if !name.is_ascii() {
        return Err(Error::InvalidArgument(format!(
            "bin name `{}` is not ASCII",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_new_converts_value() {
        let bin = Bin::new("a", 42);
        assert_eq!(bin.value, Value::Int(42));
    }

    #[test]
    fn test_validate_bin_name() {
        assert!(validate_bin_name("fifteen_chars__").is_ok());
        let err = validate_bin_name("sixteen_chars___").unwrap_err();
        assert_eq!(err.result_code(), ResultCode::BinNameTooLong);
        assert!(validate_bin_name("café").is_err());
    }
}
