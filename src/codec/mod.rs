//! Codec module - body (de)serialization.
//!
//! - [`JsonCodec`] - JSON for envelopes, arguments, values, and errors
//! - [`BodyValue`] - tagged binary/text/JSON body, driven by wire flags

mod body;
mod json;

pub use body::BodyValue;
pub use json::JsonCodec;
