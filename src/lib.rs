//! # muxwire
//!
//! Multiplexed RPC transport over one bidirectional byte stream.
//!
//! The crate takes an already-secured `AsyncRead + AsyncWrite` stream and
//! interleaves any number of concurrent calls and data streams over it:
//!
//! - **Packet framing**: 9-byte headers (flags, body length, signed id),
//!   three body encodings (binary, UTF-8, JSON), and a 9-zero-byte
//!   goodbye sentinel ending the whole connection.
//! - **Multiplexing**: every call or stream is one signed id. Ids this
//!   endpoint allocates are positive on the wire; the peer's replies come
//!   back negated and are correlated through the in-flight table.
//! - **Call kinds**: `sync`/`async` (one request, one response),
//!   `source`/`sink`/`duplex` (streams of values until ended).
//! - **Lifecycle**: graceful drain on [`Connection::close`], immediate
//!   abort on errors or a peer goodbye.
//!
//! Inbound calls are dispatched through a [`Registry`] — the local call
//! table mapping dotted method names to kind-tagged handlers.
//!
//! ## Example
//!
//! ```ignore
//! use muxwire::{Connection, Registry};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> muxwire::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register_async("echo", |args| async move {
//!         Ok(args.into_iter().next().unwrap_or(serde_json::Value::Null))
//!     });
//!     registry.register_source("count", |args, tx| async move {
//!         let n = args[0].as_i64().unwrap_or(0);
//!         for i in 0..n {
//!             tx.send_json(&i).await.ok();
//!         }
//!         Ok(())
//!     });
//!
//!     let stream = connect_somehow().await; // any AsyncRead + AsyncWrite
//!     let conn = Connection::builder(registry).spawn(stream);
//!
//!     let reply: String = conn.call_async("echo", vec![json!("hi")]).await?;
//!     conn.close().await
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;

mod connection;
mod stream;
mod writer;

pub use codec::{BodyValue, JsonCodec};
pub use connection::{Connection, ConnectionBuilder};
pub use error::{CallError, MuxError, Result};
pub use handler::{CallKind, Method, Registry};
pub use stream::{StreamReceiver, StreamSender};
