//! Handler module - the local call table.
//!
//! The [`Registry`] maps dotted method names to kind-tagged handlers. The
//! connection consults it for every inbound request: the declared kind is
//! validated against the wire's call shape before dispatch, and handler
//! results are unified into `Result<_, CallError>` at this boundary, so
//! the multiplexer only ever sees that one shape.

mod registry;

pub use registry::{BoxFuture, CallKind, HandlerResult, Method, Registry, StreamResult};

pub(crate) use registry::Handler;
