//! JSON codec using `serde_json`.
//!
//! Request envelopes, call arguments, return values, and in-band errors
//! all travel as JSON bodies. Binary and UTF-8 bodies bypass this codec
//! entirely (see [`BodyValue`](super::BodyValue)).

use crate::error::Result;

/// JSON codec for structured bodies.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "answer".to_string(),
            active: true,
        };

        let encoded = JsonCodec::encode(&original).unwrap();
        let decoded: TestStruct = JsonCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_decode_primitives() {
        let encoded = JsonCodec::encode(&123i64).unwrap();
        let decoded: i64 = JsonCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, 123);

        let encoded = JsonCodec::encode(&"hello").unwrap();
        let decoded: String = JsonCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn test_decode_invalid_json() {
        let result: Result<TestStruct> = JsonCodec::decode(b"{not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_type_mismatch() {
        let encoded = JsonCodec::encode(&"a string").unwrap();
        let result: Result<i32> = JsonCodec::decode(&encoded);
        assert!(result.is_err());
    }
}
