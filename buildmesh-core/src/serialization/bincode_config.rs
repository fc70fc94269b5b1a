//! Deterministic bincode configuration.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::SerializationError;

/// Upper bound accepted when decoding, guards against hostile length prefixes.
const DECODE_LIMIT: u64 = 16 * 1024 * 1024;

/// Fixed-size integer encoding, little-endian, trailing bytes rejected.
fn config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(DECODE_LIMIT)
        .reject_trailing_bytes()
}

/// Serialize a value to bytes using deterministic configuration.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, SerializationError> {
    config()
        .serialize(value)
        .map_err(|e| SerializationError::EncodeFailed(e.to_string()))
}

/// Serialize a value, appending to an existing buffer.
pub fn serialize_into<T: Serialize>(buf: &mut Vec<u8>, value: &T) -> Result<(), SerializationError> {
    config()
        .serialize_into(buf, value)
        .map_err(|e| SerializationError::EncodeFailed(e.to_string()))
}

/// Deserialize a value from bytes.
///
/// Fails on malformed input and on trailing bytes after the value.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    config()
        .deserialize(bytes)
        .map_err(|e| SerializationError::DecodeFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_fixed_width() {
        let bytes = serialize(&(2i32, 1_700_000_000_000_000i64)).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
    }

    #[test]
    fn test_serialize_into_appends() {
        let mut buf = serialize(&7i32).unwrap();
        serialize_into(&mut buf, &String::from("cc")).unwrap();
        assert_eq!(buf.len(), 4 + 8 + 2);
        let text: String = deserialize(&buf[4..]).unwrap();
        assert_eq!(text, "cc");
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = serialize(&42u64).unwrap();
        bytes.push(0xFF);
        assert!(deserialize::<u64>(&bytes).is_err());
    }

    #[test]
    fn test_rejects_hostile_length() {
        // A string claiming u64::MAX bytes must fail rather than allocate.
        let bytes = u64::MAX.to_le_bytes();
        assert!(deserialize::<String>(&bytes).is_err());
    }
}
