//! Handler registry for dispatching inbound calls by method name.
//!
//! Each registered method declares one of the five call kinds; the
//! per-kind `register_*` methods make a wrong handler signature a compile
//! error rather than a runtime surprise. Kind mismatches against the wire
//! are rejected per call by the connection, never here.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CallError;
use crate::stream::{StreamReceiver, StreamSender};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a value-returning (sync/async) handler.
pub type HandlerResult = std::result::Result<Value, CallError>;

/// Result of a stream (source/sink/duplex) handler.
///
/// `Ok` ends the handler's side of the stream cleanly; `Err` ends it with
/// the in-band error.
pub type StreamResult = std::result::Result<(), CallError>;

/// The kind of a call, as named in the request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Single request, single response; the handler runs synchronously.
    Sync,
    /// Single request, single response; the handler may take its time.
    Async,
    /// The callee produces a stream of values.
    Source,
    /// The caller produces a stream of values.
    Sink,
    /// Both sides produce values until both have ended.
    Duplex,
}

impl CallKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Sync => "sync",
            CallKind::Async => "async",
            CallKind::Source => "source",
            CallKind::Sink => "sink",
            CallKind::Duplex => "duplex",
        }
    }

    /// Whether calls of this kind carry the stream flag.
    pub fn is_stream(&self) -> bool {
        matches!(self, CallKind::Source | CallKind::Sink | CallKind::Duplex)
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dotted method path, carried on the wire as an array of segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(pub Vec<String>);

impl Method {
    /// Parse a dotted path (`"blobs.get"` becomes `["blobs", "get"]`).
    pub fn new(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_string).collect())
    }

    /// The dotted form used as the registry key.
    pub fn dotted(&self) -> String {
        self.0.join(".")
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        Method::new(s)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dotted())
    }
}

/// A registered handler, tagged with its declared kind.
pub(crate) enum Handler {
    Sync(Box<dyn Fn(Vec<Value>) -> HandlerResult + Send + Sync>),
    Async(Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>),
    Source(Box<dyn Fn(Vec<Value>, StreamSender) -> BoxFuture<'static, StreamResult> + Send + Sync>),
    Sink(Box<dyn Fn(Vec<Value>, StreamReceiver) -> BoxFuture<'static, StreamResult> + Send + Sync>),
    Duplex(
        Box<
            dyn Fn(Vec<Value>, StreamSender, StreamReceiver) -> BoxFuture<'static, StreamResult>
                + Send
                + Sync,
        >,
    ),
}

impl Handler {
    /// The declared kind of this handler.
    pub(crate) fn kind(&self) -> CallKind {
        match self {
            Handler::Sync(_) => CallKind::Sync,
            Handler::Async(_) => CallKind::Async,
            Handler::Source(_) => CallKind::Source,
            Handler::Sink(_) => CallKind::Sink,
            Handler::Duplex(_) => CallKind::Duplex,
        }
    }
}

/// Registry mapping method names to handlers.
///
/// Registering a name twice replaces the earlier handler.
#[derive(Default)]
pub struct Registry {
    methods: HashMap<String, Handler>,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a sync handler: plain function in, value or error out.
    pub fn register_sync<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.methods
            .insert(name.to_string(), Handler::Sync(Box::new(handler)));
    }

    /// Register an async handler.
    pub fn register_async<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let boxed = move |args| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(args)) };
        self.methods
            .insert(name.to_string(), Handler::Async(Box::new(boxed)));
    }

    /// Register a source handler: it receives a sender to produce values
    /// through. The stream ends when the handler returns (or earlier, if
    /// the handler ends it explicitly).
    pub fn register_source<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>, StreamSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StreamResult> + Send + 'static,
    {
        let boxed =
            move |args, tx| -> BoxFuture<'static, StreamResult> { Box::pin(handler(args, tx)) };
        self.methods
            .insert(name.to_string(), Handler::Source(Box::new(boxed)));
    }

    /// Register a sink handler: it receives the caller's values through a
    /// receiver until the caller ends.
    pub fn register_sink<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>, StreamReceiver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StreamResult> + Send + 'static,
    {
        let boxed =
            move |args, rx| -> BoxFuture<'static, StreamResult> { Box::pin(handler(args, rx)) };
        self.methods
            .insert(name.to_string(), Handler::Sink(Box::new(boxed)));
    }

    /// Register a duplex handler: values flow both ways until both sides
    /// have ended.
    pub fn register_duplex<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Vec<Value>, StreamSender, StreamReceiver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StreamResult> + Send + 'static,
    {
        let boxed = move |args, tx, rx| -> BoxFuture<'static, StreamResult> {
            Box::pin(handler(args, tx, rx))
        };
        self.methods
            .insert(name.to_string(), Handler::Duplex(Box::new(boxed)));
    }

    /// Declared kind of a method, if registered.
    pub fn kind_of(&self, name: &str) -> Option<CallKind> {
        self.methods.get(name).map(Handler::kind)
    }

    /// Whether a method is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Look up a handler for dispatch.
    pub(crate) fn get(&self, name: &str) -> Option<&Handler> {
        self.methods.get(name)
    }
}
