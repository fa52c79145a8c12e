//! Error types for muxwire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// In-band error shape carried on the wire.
///
/// Responses and stream ends that fail deliver this object as a JSON body
/// instead of a value. The receiving side reconstructs it as
/// [`MuxError::Remote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    /// Error class name. The wire convention is the literal `"Error"`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional stack trace from the peer. Accepted but never emitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl CallError {
    /// Create a new call error with the conventional `"Error"` name.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for CallError {}

/// Main error type for all muxwire operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error at a call boundary.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed header, oversized body, or unrecognized body type.
    /// Fatal to the connection; no further decoding is attempted.
    #[error("framing error: {0}")]
    Framing(String),

    /// Error reported in-band by the peer for one call or stream.
    #[error("remote error: {0}")]
    Remote(CallError),

    /// Inbound request named a method the registry does not know.
    #[error("no such method: {0}")]
    NoSuchMethod(String),

    /// The wire's call shape does not match the method's declared kind.
    #[error("method {method} is declared {declared}, called as {called}")]
    KindMismatch {
        method: String,
        declared: &'static str,
        called: &'static str,
    },

    /// A terminal result had no channel left to be delivered through.
    /// Fatal to the connection.
    #[error("no callback left for request {0}")]
    NoCallback(i32),

    /// The connection closed while the operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// Writer queue stayed full past the configured timeout.
    #[error("backpressure timeout")]
    Backpressure,
}

impl MuxError {
    /// Whether this error must tear down the whole connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MuxError::Io(_) | MuxError::Framing(_) | MuxError::NoCallback(_)
        )
    }

    /// Flatten into the in-band wire shape.
    pub fn into_call_error(self) -> CallError {
        match self {
            MuxError::Remote(e) => e,
            other => CallError::new(other.to_string()),
        }
    }
}

/// Result type alias using MuxError.
pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_display() {
        let e = CallError::new("boom");
        assert_eq!(e.to_string(), "Error: boom");
        assert_eq!(e.name, "Error");
    }

    #[test]
    fn test_call_error_json_roundtrip() {
        let e = CallError::new("intentional");
        let json = serde_json::to_string(&e).unwrap();
        assert!(!json.contains("stack"));

        let back: CallError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_call_error_accepts_stack() {
        let json = r#"{"name":"Error","message":"bad","stack":"at foo()"}"#;
        let e: CallError = serde_json::from_str(json).unwrap();
        assert_eq!(e.message, "bad");
        assert_eq!(e.stack.as_deref(), Some("at foo()"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MuxError::Framing("bad".into()).is_fatal());
        assert!(MuxError::NoCallback(7).is_fatal());
        assert!(!MuxError::Remote(CallError::new("x")).is_fatal());
        assert!(!MuxError::ConnectionClosed.is_fatal());
        assert!(!MuxError::Backpressure.is_fatal());
    }

    #[test]
    fn test_into_call_error_preserves_remote() {
        let e = MuxError::Remote(CallError::new("kept"));
        assert_eq!(e.into_call_error().message, "kept");

        let e = MuxError::NoSuchMethod("foo".into());
        assert_eq!(e.into_call_error().message, "no such method: foo");
    }
}
