//! Connection: the stream multiplexer and its lifecycle.
//!
//! One `Connection` owns one already-secured bidirectional byte stream and
//! multiplexes any number of concurrent calls and streams over it, all
//! correlated by signed packet ids. The reader task negates every
//! incoming id, so exchanges this endpoint opened always live under
//! positive ids in the in-flight table and peer-opened ones under
//! negative ids; outbound packets carry the table id as-is.
//!
//! Lifecycle: `close()` sends the goodbye sentinel and drains in-flight
//! work gracefully; `close_with_error()`, a peer goodbye, EOF, or any
//! framing/IO failure aborts immediately, delivering a connection-closed
//! error to every outstanding caller and stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::codec::BodyValue;
use crate::error::{CallError, MuxError, Result};
use crate::handler::{CallKind, Handler, Method, Registry};
use crate::protocol::{BodyType, Decoded, Packet, PacketDecoder, DEFAULT_MAX_BODY_SIZE};
use crate::stream::{StreamEvent, StreamReceiver, StreamSender};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// JSON request envelope: the opening packet body of every call.
#[derive(Debug, Serialize, Deserialize)]
struct CallRequest {
    name: Method,
    args: Vec<Value>,
    #[serde(rename = "type")]
    kind: CallKind,
}

/// Connection-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    /// Goodbye sent, draining in-flight ids.
    Closing,
    Closed,
}

/// What a pending sync/async call resolves to.
type CallOutcome = std::result::Result<BodyValue, MuxError>;

/// One in-flight id.
enum Entry {
    /// Outbound sync/async call awaiting its single response.
    Pending(oneshot::Sender<CallOutcome>),
    /// Inbound sync/async call whose handler has not completed yet.
    Running,
    /// Open stream, either direction of origin.
    Stream(StreamEntry),
}

struct StreamEntry {
    kind: CallKind,
    /// Where incoming items and ends are delivered, when the local side
    /// consumes them (source caller, sink/duplex handler input).
    to_local: Option<mpsc::UnboundedSender<StreamEvent>>,
    local_ended: bool,
    remote_ended: bool,
}

struct Table {
    /// Next locally-originated id; always positive, never reused while
    /// in flight.
    next_id: i32,
    entries: HashMap<i32, Entry>,
    state: ConnState,
}

/// State shared between the connection handle, the reader task, and every
/// stream handle.
pub(crate) struct Shared {
    writer: WriterHandle,
    registry: Arc<Registry>,
    table: Mutex<Table>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl Shared {
    /// Allocate an id and register a pending-response entry.
    fn alloc_pending(&self) -> Result<(i32, oneshot::Receiver<CallOutcome>)> {
        let mut table = self.table.lock().unwrap();
        if table.state != ConnState::Open {
            return Err(MuxError::ConnectionClosed);
        }
        let id = table.next_id;
        table.next_id += 1;
        let (tx, rx) = oneshot::channel();
        table.entries.insert(id, Entry::Pending(tx));
        Ok((id, rx))
    }

    /// Allocate an id and register a stream entry.
    fn alloc_stream(
        &self,
        kind: CallKind,
        with_receiver: bool,
    ) -> Result<(i32, Option<mpsc::UnboundedReceiver<StreamEvent>>)> {
        let mut table = self.table.lock().unwrap();
        if table.state != ConnState::Open {
            return Err(MuxError::ConnectionClosed);
        }
        let id = table.next_id;
        table.next_id += 1;

        let (to_local, rx) = if with_receiver {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        table.entries.insert(
            id,
            Entry::Stream(StreamEntry {
                kind,
                to_local,
                local_ended: false,
                remote_ended: false,
            }),
        );
        Ok((id, rx))
    }

    /// Drop an entry without any delivery (rollback after a failed send).
    fn remove_entry(&self, id: i32) {
        self.table.lock().unwrap().entries.remove(&id);
        self.maybe_finalize();
    }

    /// Send one stream item for an open, not-locally-ended stream.
    pub(crate) async fn stream_send(&self, id: i32, value: BodyValue) -> Result<()> {
        {
            let table = self.table.lock().unwrap();
            match table.entries.get(&id) {
                Some(Entry::Stream(se)) if !se.local_ended => {}
                _ => return Err(MuxError::ConnectionClosed),
            }
        }

        let (body_type, body) = value.encode()?;
        self.writer.send_packet(&Packet::data(id, body_type, body)).await
    }

    /// End the local direction of a stream.
    ///
    /// A clean end on an already-ended stream is a no-op; an error end
    /// with no channel left to carry it is the no-callback condition and
    /// reports [`MuxError::NoCallback`].
    pub(crate) async fn stream_local_end(&self, id: i32, err: Option<CallError>) -> Result<()> {
        let retired = {
            let mut table = self.table.lock().unwrap();
            if table.state == ConnState::Closed {
                return match err {
                    None => Ok(()),
                    Some(_) => Err(MuxError::ConnectionClosed),
                };
            }
            let retired = match table.entries.get_mut(&id) {
                Some(Entry::Stream(se)) if !se.local_ended => {
                    se.local_ended = true;
                    // An error end tears the exchange down at once; a
                    // clean end waits for the other direction.
                    se.remote_ended || err.is_some()
                }
                _ => {
                    // Already ended, retired, or not a stream: a clean
                    // end is harmless, an undeliverable error is not.
                    return match err {
                        None => Ok(()),
                        Some(_) => Err(MuxError::NoCallback(id)),
                    };
                }
            };
            if retired {
                table.entries.remove(&id);
            }
            retired
        };

        let pkt = match err {
            None => Packet::end_ok(id, true),
            Some(ref e) => Packet::end_err(id, true, e)?,
        };
        let sent = self.writer.send_packet(&pkt).await;

        if retired {
            self.maybe_finalize();
        }
        sent
    }

    /// Abort: resolve everything in flight with a connection-closed error
    /// and mark the connection closed. Idempotent.
    fn abort(&self) {
        let entries = {
            let mut table = self.table.lock().unwrap();
            if table.state == ConnState::Closed {
                return;
            }
            table.state = ConnState::Closed;
            std::mem::take(&mut table.entries)
        };

        for (_, entry) in entries {
            match entry {
                Entry::Pending(tx) => {
                    let _ = tx.send(Err(MuxError::ConnectionClosed));
                }
                Entry::Running => {}
                Entry::Stream(se) => {
                    if let Some(tx) = se.to_local {
                        let _ = tx.send(StreamEvent::Aborted);
                    }
                }
            }
        }

        let _ = self.closed_tx.send(true);
    }

    /// Finalize a graceful close once the in-flight table has drained.
    fn maybe_finalize(&self) {
        let finalize = {
            let mut table = self.table.lock().unwrap();
            if table.state == ConnState::Closing && table.entries.is_empty() {
                table.state = ConnState::Closed;
                true
            } else {
                false
            }
        };
        if finalize {
            let _ = self.closed_tx.send(true);
        }
    }

    fn is_open(&self) -> bool {
        self.table.lock().unwrap().state != ConnState::Closed
    }
}

/// Builder for configuring and spawning a connection.
pub struct ConnectionBuilder {
    registry: Registry,
    max_body_size: u32,
    writer_config: WriterConfig,
}

impl ConnectionBuilder {
    /// Create a builder around the local call table.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            writer_config: WriterConfig::default(),
        }
    }

    /// Cap on a single packet body, enforced on both decode and encode
    /// paths. Default: 16 MiB.
    pub fn max_body_size(mut self, bytes: u32) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Maximum queued outbound frames before senders start waiting.
    pub fn max_pending_packets(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self.writer_config.channel_capacity = limit;
        self
    }

    /// How long senders wait for the outbound queue to drain.
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Split the stream and spawn the writer and reader tasks.
    pub fn spawn<S>(self, io: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (writer, _writer_task) = spawn_writer_task(write_half, self.writer_config);

        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            writer,
            registry: Arc::new(self.registry),
            table: Mutex::new(Table {
                next_id: 1,
                entries: HashMap::new(),
                state: ConnState::Open,
            }),
            closed_tx,
            closed_rx,
        });

        let reader_shared = shared.clone();
        let max_body_size = self.max_body_size;
        tokio::spawn(async move {
            if let Err(e) = read_loop(read_half, reader_shared, max_body_size).await {
                error!(error = %e, "connection read loop failed");
            }
        });

        Connection { shared }
    }
}

/// A running multiplexed connection.
///
/// Cheaply cloneable; all clones share the same in-flight table and
/// underlying stream.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a builder around the local call table.
    pub fn builder(registry: Registry) -> ConnectionBuilder {
        ConnectionBuilder::new(registry)
    }

    /// Call a remote sync method and await its single response.
    pub async fn call_sync<T: DeserializeOwned>(
        &self,
        method: impl Into<Method>,
        args: Vec<Value>,
    ) -> Result<T> {
        self.do_call(CallKind::Sync, method.into(), args).await
    }

    /// Call a remote async method and await its single response.
    pub async fn call_async<T: DeserializeOwned>(
        &self,
        method: impl Into<Method>,
        args: Vec<Value>,
    ) -> Result<T> {
        self.do_call(CallKind::Async, method.into(), args).await
    }

    async fn do_call<T: DeserializeOwned>(
        &self,
        kind: CallKind,
        method: Method,
        args: Vec<Value>,
    ) -> Result<T> {
        let (id, rx) = self.shared.alloc_pending()?;

        let envelope = CallRequest {
            name: method,
            args,
            kind,
        };
        let pkt = match Packet::request(id, &envelope, false) {
            Ok(pkt) => pkt,
            Err(e) => {
                self.shared.remove_entry(id);
                return Err(e);
            }
        };

        if let Err(e) = self.shared.writer.send_packet(&pkt).await {
            self.shared.remove_entry(id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => decode_value(value),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MuxError::ConnectionClosed),
        }
    }

    /// Open a source stream: the remote produces, we consume.
    pub async fn source(
        &self,
        method: impl Into<Method>,
        args: Vec<Value>,
    ) -> Result<StreamReceiver> {
        let (id, rx) = self.shared.alloc_stream(CallKind::Source, true)?;
        self.open_stream(id, method.into(), args, CallKind::Source)
            .await?;
        Ok(StreamReceiver::new(rx.expect("receiver requested")))
    }

    /// Open a sink stream: we produce, the remote consumes.
    pub async fn sink(&self, method: impl Into<Method>, args: Vec<Value>) -> Result<StreamSender> {
        let (id, _) = self.shared.alloc_stream(CallKind::Sink, false)?;
        self.open_stream(id, method.into(), args, CallKind::Sink)
            .await?;
        Ok(StreamSender::new(id, self.shared.clone()))
    }

    /// Open a duplex stream: values flow both ways until both sides end.
    pub async fn duplex(
        &self,
        method: impl Into<Method>,
        args: Vec<Value>,
    ) -> Result<(StreamSender, StreamReceiver)> {
        let (id, rx) = self.shared.alloc_stream(CallKind::Duplex, true)?;
        self.open_stream(id, method.into(), args, CallKind::Duplex)
            .await?;
        Ok((
            StreamSender::new(id, self.shared.clone()),
            StreamReceiver::new(rx.expect("receiver requested")),
        ))
    }

    async fn open_stream(
        &self,
        id: i32,
        method: Method,
        args: Vec<Value>,
        kind: CallKind,
    ) -> Result<()> {
        let envelope = CallRequest {
            name: method,
            args,
            kind,
        };
        let pkt = match Packet::request(id, &envelope, true) {
            Ok(pkt) => pkt,
            Err(e) => {
                self.shared.remove_entry(id);
                return Err(e);
            }
        };

        if let Err(e) = self.shared.writer.send_packet(&pkt).await {
            self.shared.remove_entry(id);
            return Err(e);
        }
        Ok(())
    }

    /// Gracefully close: send goodbye, stop accepting new outbound calls,
    /// finalize once every in-flight id has reached its end (immediately
    /// if none are in flight). Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        let initiate = {
            let mut table = self.shared.table.lock().unwrap();
            if table.state == ConnState::Open {
                table.state = ConnState::Closing;
                true
            } else {
                false
            }
        };
        if !initiate {
            return Ok(());
        }

        if let Err(e) = self.shared.writer.send_goodbye().await {
            warn!(error = %e, "goodbye could not be written, aborting");
            self.shared.abort();
            return Ok(());
        }

        self.shared.maybe_finalize();
        Ok(())
    }

    /// Abort: deliver a connection-closed error to every in-flight caller
    /// and stream, without a goodbye. Idempotent.
    pub fn close_with_error(&self, message: &str) {
        warn!(message, "closing connection with error");
        self.shared.abort();
    }

    /// Whether the connection has not yet fully closed.
    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Wait until the connection has fully closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Convert a resolved response body into the caller's expected type.
fn decode_value<T: DeserializeOwned>(value: BodyValue) -> Result<T> {
    let json = match value {
        BodyValue::Json(v) => v,
        BodyValue::Text(s) => Value::String(s),
        BodyValue::Binary(_) => {
            return Err(MuxError::Json(<serde_json::Error as serde::de::Error>::custom(
                "binary response body for a typed call",
            )))
        }
    };
    Ok(serde_json::from_value(json)?)
}

/// Parse a response body as either a success value or an in-band error.
///
/// The error shape is a JSON object with `name == "Error"` and a message,
/// matching what the peer's failed calls emit.
fn parse_response(pkt: &Packet) -> CallOutcome {
    if pkt.body_type() == BodyType::Json {
        if let Ok(e) = serde_json::from_slice::<CallError>(&pkt.body) {
            if e.name == "Error" {
                return Err(MuxError::Remote(e));
            }
        }
    }
    BodyValue::decode(pkt.body_type(), pkt.body.clone()).map_err(Into::into)
}

/// Parse a stream-end body: `true` is a clean end, anything else is an
/// error end.
fn parse_stream_end(pkt: &Packet) -> Option<CallError> {
    if pkt.is_end_ok() {
        return None;
    }
    match serde_json::from_slice::<CallError>(&pkt.body) {
        Ok(e) => Some(e),
        Err(_) => Some(CallError::new("stream ended with unreadable error body")),
    }
}

/// Reader task: decode, classify, dispatch; one packet at a time in
/// arrival order.
async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, max_body_size: u32) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = PacketDecoder::with_max_body(max_body_size);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        if !shared.is_open() {
            return Ok(());
        }

        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("transport EOF");
                shared.abort();
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                shared.abort();
                return Err(MuxError::Io(e));
            }
        };

        let items = match decoder.push(&buf[..n]) {
            Ok(items) => items,
            Err(e) => {
                // Framing errors are connection-fatal.
                shared.abort();
                return Err(e);
            }
        };

        for item in items {
            match item {
                Decoded::Goodbye => {
                    debug!("goodbye from peer");
                    shared.abort();
                    return Ok(());
                }
                Decoded::Packet(pkt) => {
                    if let Err(e) = handle_packet(&shared, pkt).await {
                        if e.is_fatal() {
                            shared.abort();
                            return Err(e);
                        }
                        warn!(error = %e, "packet not fully handled");
                    }
                }
            }
        }
    }
}

/// What to do after the table lookup, outside the table lock.
enum PostAction {
    None,
    /// Resolve a pending call with this packet's body.
    Resolve(oneshot::Sender<CallOutcome>),
    /// Acknowledge a remote end with an end-ok of our own.
    EchoEnd { retired: bool },
    /// An entry was retired; a graceful close may now finalize.
    Retired,
    /// Unknown id: this may open a new inbound call.
    NewRequest,
}

/// Classify one inbound packet and carry out its effects.
///
/// Only fatal conditions return an error; everything recoverable is
/// logged and absorbed here.
async fn handle_packet(shared: &Arc<Shared>, mut pkt: Packet) -> Result<()> {
    // Ingress negation: our exchanges come back positive, peer-opened
    // ones negative.
    pkt.id = -pkt.id;
    let id = pkt.id;

    enum Class {
        Pending,
        Running,
        Stream,
        Unknown,
    }

    let action = {
        let mut table = shared.table.lock().unwrap();

        let class = match table.entries.get(&id) {
            Some(Entry::Pending(_)) => Class::Pending,
            Some(Entry::Running) => Class::Running,
            Some(Entry::Stream(_)) => Class::Stream,
            None => Class::Unknown,
        };

        match class {
            Class::Pending => {
                if pkt.is_stream() {
                    warn!(id, "stream packet for a pending call, dropping");
                    PostAction::None
                } else {
                    match table.entries.remove(&id) {
                        Some(Entry::Pending(tx)) => PostAction::Resolve(tx),
                        _ => unreachable!("entry kind checked above"),
                    }
                }
            }

            Class::Running => {
                // Duplicate request id or stray packet while the handler
                // runs; either way there is nothing to route it to.
                warn!(id, "packet for an inbound call in progress, dropping");
                PostAction::None
            }

            Class::Stream => {
                if pkt.is_end() {
                    match parse_stream_end(&pkt) {
                        None => {
                            let (notify, echo, retired) = {
                                let se = match table.entries.get_mut(&id) {
                                    Some(Entry::Stream(se)) => se,
                                    _ => unreachable!("entry kind checked above"),
                                };
                                se.remote_ended = true;
                                // A locally-originated source or sink
                                // never ends on its own; acknowledge so
                                // the id can retire on both sides.
                                let echo = id > 0
                                    && !se.local_ended
                                    && matches!(se.kind, CallKind::Source | CallKind::Sink);
                                if echo {
                                    se.local_ended = true;
                                }
                                (
                                    se.to_local.clone(),
                                    echo,
                                    se.local_ended && se.remote_ended,
                                )
                            };
                            if let Some(tx) = notify {
                                let _ = tx.send(StreamEvent::End);
                            }
                            if retired {
                                table.entries.remove(&id);
                            }
                            if echo {
                                PostAction::EchoEnd { retired }
                            } else if retired {
                                PostAction::Retired
                            } else {
                                PostAction::None
                            }
                        }
                        Some(e) => {
                            // An error end tears the whole exchange down.
                            let notify = match table.entries.remove(&id) {
                                Some(Entry::Stream(se)) => se.to_local,
                                _ => None,
                            };
                            if let Some(tx) = notify {
                                let _ = tx.send(StreamEvent::Error(e));
                            }
                            PostAction::Retired
                        }
                    }
                } else {
                    let notify = match table.entries.get(&id) {
                        Some(Entry::Stream(se)) => se.to_local.clone(),
                        _ => None,
                    };
                    match notify {
                        Some(tx) => match BodyValue::decode(pkt.body_type(), pkt.body.clone()) {
                            Ok(v) => {
                                let _ = tx.send(StreamEvent::Item(v));
                                PostAction::None
                            }
                            Err(e) => {
                                warn!(id, error = %e, "undecodable stream item, dropping");
                                PostAction::None
                            }
                        },
                        None => {
                            warn!(id, "stream data for a write-only stream, dropping");
                            PostAction::None
                        }
                    }
                }
            }

            Class::Unknown => {
                if pkt.is_end() {
                    // Response or end for an id we no longer know:
                    // duplicate or stale. Ignored by design.
                    warn!(id, "terminal packet for unknown id, dropping");
                    PostAction::None
                } else {
                    PostAction::NewRequest
                }
            }
        }
    };

    match action {
        PostAction::None => Ok(()),
        PostAction::Resolve(tx) => {
            let _ = tx.send(parse_response(&pkt));
            shared.maybe_finalize();
            Ok(())
        }
        PostAction::EchoEnd { retired } => {
            let sent = shared.writer.send_packet(&Packet::end_ok(id, true)).await;
            if retired {
                shared.maybe_finalize();
            }
            if let Err(e) = sent {
                debug!(id, error = %e, "end acknowledgement not written");
            }
            Ok(())
        }
        PostAction::Retired => {
            shared.maybe_finalize();
            Ok(())
        }
        PostAction::NewRequest => handle_new_request(shared, pkt).await,
    }
}

/// Dispatch an unknown-id packet as a new inbound call.
async fn handle_new_request(shared: &Arc<Shared>, pkt: Packet) -> Result<()> {
    let id = pkt.id;

    let accepting = {
        let table = shared.table.lock().unwrap();
        table.state == ConnState::Open
    };
    if !accepting {
        warn!(id, "inbound request while closing, dropping");
        return Ok(());
    }

    let req: CallRequest = if pkt.body_type() == BodyType::Json {
        match serde_json::from_slice(&pkt.body) {
            Ok(req) => req,
            Err(e) => {
                if pkt.is_stream() {
                    warn!(id, error = %e, "stream data for unknown id, dropping");
                } else {
                    warn!(id, error = %e, "unroutable packet, dropping");
                }
                return Ok(());
            }
        }
    } else {
        warn!(id, "non-JSON opening packet for unknown id, dropping");
        return Ok(());
    };

    let name = req.name.dotted();

    // The wire's shape and the envelope's declared kind must agree.
    if req.kind.is_stream() != pkt.is_stream() {
        return reject(
            shared,
            &pkt,
            CallError::new(format!(
                "call kind {} does not match its wire shape",
                req.kind
            )),
        )
        .await;
    }

    let registry = shared.registry.clone();
    let handler = match registry.get(&name) {
        Some(h) => h,
        None => {
            return reject(shared, &pkt, CallError::new(format!("no such method: {name}"))).await;
        }
    };

    // sync and async share the non-stream shape; stream kinds must match
    // the declared direction exactly.
    let declared = handler.kind();
    let compatible = match (declared, req.kind) {
        (CallKind::Sync | CallKind::Async, CallKind::Sync | CallKind::Async) => true,
        (d, k) => d == k,
    };
    if !compatible {
        let e = MuxError::KindMismatch {
            method: name.clone(),
            declared: declared.as_str(),
            called: req.kind.as_str(),
        };
        return reject(shared, &pkt, e.into_call_error()).await;
    }

    match handler {
        Handler::Sync(f) => {
            if !try_insert(shared, id, Entry::Running) {
                return Ok(());
            }
            // A failing sync handler becomes the in-band error response;
            // it must never fall through as a connection fault.
            let result = f(req.args);
            finish_value_call(shared, id, result).await
        }

        Handler::Async(f) => {
            if !try_insert(shared, id, Entry::Running) {
                return Ok(());
            }
            let fut = f(req.args);
            let shared = shared.clone();
            spawn_completion(shared.clone(), async move {
                let result = fut.await;
                finish_value_call(&shared, id, result).await
            });
            Ok(())
        }

        Handler::Source(f) => {
            let entry = Entry::Stream(StreamEntry {
                kind: CallKind::Source,
                to_local: None,
                local_ended: false,
                remote_ended: false,
            });
            if !try_insert(shared, id, entry) {
                return Ok(());
            }
            let fut = f(req.args, StreamSender::new(id, shared.clone()));
            let shared = shared.clone();
            spawn_completion(shared.clone(), async move {
                let result = fut.await;
                finish_stream_call(&shared, id, result).await
            });
            Ok(())
        }

        Handler::Sink(f) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let entry = Entry::Stream(StreamEntry {
                kind: CallKind::Sink,
                to_local: Some(tx),
                local_ended: false,
                remote_ended: false,
            });
            if !try_insert(shared, id, entry) {
                return Ok(());
            }
            let fut = f(req.args, StreamReceiver::new(rx));
            let shared = shared.clone();
            spawn_completion(shared.clone(), async move {
                let result = fut.await;
                finish_stream_call(&shared, id, result).await
            });
            Ok(())
        }

        Handler::Duplex(f) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let entry = Entry::Stream(StreamEntry {
                kind: CallKind::Duplex,
                to_local: Some(tx),
                local_ended: false,
                remote_ended: false,
            });
            if !try_insert(shared, id, entry) {
                return Ok(());
            }
            let fut = f(
                req.args,
                StreamSender::new(id, shared.clone()),
                StreamReceiver::new(rx),
            );
            let shared = shared.clone();
            spawn_completion(shared.clone(), async move {
                let result = fut.await;
                finish_stream_call(&shared, id, result).await
            });
            Ok(())
        }
    }
}

/// Register an inbound id, unless the peer is reusing one in flight.
fn try_insert(shared: &Shared, id: i32, entry: Entry) -> bool {
    let mut table = shared.table.lock().unwrap();
    if table.entries.contains_key(&id) {
        warn!(id, "peer reused an in-flight id, dropping request");
        return false;
    }
    table.entries.insert(id, entry);
    true
}

/// Send an in-band rejection for a call that never got dispatched.
async fn reject(shared: &Shared, pkt: &Packet, err: CallError) -> Result<()> {
    debug!(id = pkt.id, error = %err.message, "rejecting inbound call");
    let reply = if pkt.is_stream() {
        Packet::end_err(pkt.id, true, &err)?
    } else {
        Packet::response(pkt.id, serde_json::to_vec(&err)?.into())
    };
    if let Err(e) = shared.writer.send_packet(&reply).await {
        debug!(error = %e, "rejection not written");
    }
    Ok(())
}

/// Deliver a sync/async handler outcome as the single response packet.
async fn finish_value_call(
    shared: &Shared,
    id: i32,
    result: std::result::Result<Value, CallError>,
) -> Result<()> {
    {
        let mut table = shared.table.lock().unwrap();
        if table.state == ConnState::Closed {
            return Ok(());
        }
        match table.entries.remove(&id) {
            Some(_) => {}
            // The response channel was already consumed and there is
            // nothing left to deliver through: fatal by contract.
            None => return Err(MuxError::NoCallback(id)),
        }
    }
    shared.maybe_finalize();

    let body = match &result {
        Ok(v) => serde_json::to_vec(v)?,
        Err(e) => serde_json::to_vec(e)?,
    };
    shared.writer.send_packet(&Packet::response(id, body.into())).await
}

/// Deliver a stream handler outcome as the local end of its stream.
async fn finish_stream_call(
    shared: &Shared,
    id: i32,
    result: std::result::Result<(), CallError>,
) -> Result<()> {
    match result {
        // The handler may have ended explicitly already; a second clean
        // end is a no-op.
        Ok(()) => shared.stream_local_end(id, None).await,
        Err(e) => shared.stream_local_end(id, Some(e)).await,
    }
}

/// Run a handler completion, escalating fatal failures to an abort.
fn spawn_completion<F>(shared: Arc<Shared>, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            if e.is_fatal() {
                error!(error = %e, "handler completion failed fatally, aborting connection");
                shared.abort();
            } else {
                debug!(error = %e, "handler completion not delivered");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    fn echo_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_async("echo", |args| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        });
        registry
    }

    fn pair(a: Registry, b: Registry) -> (Connection, Connection) {
        let (left, right) = duplex(256 * 1024);
        (
            Connection::builder(a).spawn(left),
            Connection::builder(b).spawn(right),
        )
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client, _server) = pair(Registry::new(), echo_registry());

        let reply: String = client
            .call_async("echo", vec![json!("hello")])
            .await
            .unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test]
    async fn test_sync_call_roundtrip() {
        let mut registry = Registry::new();
        registry.register_sync("add", |args| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        let (client, _server) = pair(Registry::new(), registry);

        let sum: i64 = client
            .call_sync("add", vec![json!(20), json!(22)])
            .await
            .unwrap();
        assert_eq!(sum, 42);
    }

    #[tokio::test]
    async fn test_is_open_and_idempotent_close() {
        let (client, _server) = pair(Registry::new(), Registry::new());

        assert!(client.is_open());
        client.close().await.unwrap();
        client.close().await.unwrap();
        client.closed().await;
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_goodbye_closes_the_peer() {
        let (client, server) = pair(Registry::new(), Registry::new());

        client.close().await.unwrap();
        server.closed().await;
        assert!(!server.is_open());
    }

    #[tokio::test]
    async fn test_calls_rejected_after_close() {
        let (client, _server) = pair(Registry::new(), echo_registry());

        client.close().await.unwrap();
        let result: Result<Value> = client.call_async("echo", vec![]).await;
        assert!(matches!(result, Err(MuxError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_ids_allocated_monotonically() {
        let (client, _server) = pair(Registry::new(), echo_registry());

        let a = client.shared.alloc_pending().unwrap().0;
        let b = client.shared.alloc_pending().unwrap().0;
        let c = client.shared.alloc_stream(CallKind::Source, true).unwrap().0;

        assert!(0 < a && a < b && b < c);
    }
}
