//! Typed body values.
//!
//! Every packet body is one of three encodings, tagged in the header's
//! flag bits. `BodyValue` is the decoded form that flows through stream
//! handles and handler arguments; which variant a value lands in is
//! decided entirely by the wire flags, never by sniffing the bytes.

use bytes::Bytes;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::BodyType;

use super::JsonCodec;

/// A decoded packet body.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyValue {
    /// Raw bytes.
    Binary(Bytes),
    /// UTF-8 text.
    Text(String),
    /// JSON value.
    Json(Value),
}

impl BodyValue {
    /// Decode raw body bytes according to their wire type.
    ///
    /// Binary passes through zero-copy; UTF-8 is validated; JSON is
    /// parsed.
    pub fn decode(body_type: BodyType, body: Bytes) -> Result<Self> {
        match body_type {
            BodyType::Binary => Ok(BodyValue::Binary(body)),
            BodyType::Utf8 => {
                let text = std::str::from_utf8(&body)
                    .map_err(|e| crate::error::MuxError::Framing(format!("invalid utf8 body: {e}")))?
                    .to_string();
                Ok(BodyValue::Text(text))
            }
            BodyType::Json => Ok(BodyValue::Json(JsonCodec::decode(&body)?)),
        }
    }

    /// Encode into wire bytes plus the matching body type tag.
    pub fn encode(&self) -> Result<(BodyType, Bytes)> {
        match self {
            BodyValue::Binary(b) => Ok((BodyType::Binary, b.clone())),
            BodyValue::Text(s) => Ok((BodyType::Utf8, Bytes::copy_from_slice(s.as_bytes()))),
            BodyValue::Json(v) => Ok((BodyType::Json, Bytes::from(JsonCodec::encode(v)?))),
        }
    }

    /// The wire type this value encodes as.
    pub fn body_type(&self) -> BodyType {
        match self {
            BodyValue::Binary(_) => BodyType::Binary,
            BodyValue::Text(_) => BodyType::Utf8,
            BodyValue::Json(_) => BodyType::Json,
        }
    }
}

impl From<Bytes> for BodyValue {
    fn from(b: Bytes) -> Self {
        BodyValue::Binary(b)
    }
}

impl From<Vec<u8>> for BodyValue {
    fn from(b: Vec<u8>) -> Self {
        BodyValue::Binary(Bytes::from(b))
    }
}

impl From<String> for BodyValue {
    fn from(s: String) -> Self {
        BodyValue::Text(s)
    }
}

impl From<&str> for BodyValue {
    fn from(s: &str) -> Self {
        BodyValue::Text(s.to_string())
    }
}

impl From<Value> for BodyValue {
    fn from(v: Value) -> Self {
        BodyValue::Json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binary_passthrough() {
        let body = Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let value = BodyValue::decode(BodyType::Binary, body.clone()).unwrap();
        assert_eq!(value, BodyValue::Binary(body.clone()));

        let (bt, encoded) = value.encode().unwrap();
        assert_eq!(bt, BodyType::Binary);
        assert_eq!(encoded, body);
    }

    #[test]
    fn test_text_roundtrip() {
        let value = BodyValue::from("hello");
        let (bt, bytes) = value.encode().unwrap();
        assert_eq!(bt, BodyType::Utf8);

        let back = BodyValue::decode(bt, bytes).unwrap();
        assert_eq!(back, BodyValue::Text("hello".to_string()));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let body = Bytes::from_static(&[0xFF, 0xFE]);
        assert!(BodyValue::decode(BodyType::Utf8, body).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let value = BodyValue::from(json!({"a": [1, 2, 3]}));
        let (bt, bytes) = value.encode().unwrap();
        assert_eq!(bt, BodyType::Json);

        let back = BodyValue::decode(bt, bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_type_decided_by_flags_not_content() {
        // JSON-looking bytes under the binary tag stay binary.
        let body = Bytes::from_static(b"{\"a\":1}");
        let value = BodyValue::decode(BodyType::Binary, body.clone()).unwrap();
        assert_eq!(value, BodyValue::Binary(body));
    }
}
