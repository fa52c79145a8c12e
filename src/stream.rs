//! Stream handles.
//!
//! One adapter with exactly two capabilities covers every stream shape:
//! [`StreamReceiver`] produces the next item or the end, and
//! [`StreamSender`] accepts the next item or the end. A `source` call
//! hands the caller a receiver and the callee a sender; `sink` is the
//! mirror image; `duplex` is one of each on both sides.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::codec::BodyValue;
use crate::connection::Shared;
use crate::error::{CallError, MuxError, Result};

/// What the connection delivers into a stream's local consumer.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// Next value from the peer.
    Item(BodyValue),
    /// Peer ended the stream cleanly.
    End,
    /// Peer ended the stream with an error.
    Error(CallError),
    /// The whole connection went away.
    Aborted,
}

/// Read side of a stream: produce the next item or the end.
///
/// `Ok(Some(value))` is the next item, `Ok(None)` is a clean end, and an
/// error is either the peer's in-band error end or a connection abort.
/// After any terminal outcome, further calls return `Ok(None)`.
pub struct StreamReceiver {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    done: bool,
}

impl StreamReceiver {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self { rx, done: false }
    }

    /// Receive the next value, waiting until the peer sends one or ends.
    pub async fn recv(&mut self) -> Result<Option<BodyValue>> {
        if self.done {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(StreamEvent::Item(v)) => Ok(Some(v)),
            Some(StreamEvent::End) => {
                self.done = true;
                Ok(None)
            }
            Some(StreamEvent::Error(e)) => {
                self.done = true;
                Err(MuxError::Remote(e))
            }
            Some(StreamEvent::Aborted) | None => {
                self.done = true;
                Err(MuxError::ConnectionClosed)
            }
        }
    }

    /// Collect every remaining item until the clean end.
    ///
    /// An error end discards the items received so far and returns the
    /// error.
    pub async fn collect(mut self) -> Result<Vec<BodyValue>> {
        let mut items = Vec::new();
        while let Some(v) = self.recv().await? {
            items.push(v);
        }
        Ok(items)
    }
}

impl std::fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("done", &self.done)
            .finish()
    }
}

/// Write side of a stream: accept the next item or the end.
///
/// Cloneable; ending through any clone ends the direction for all of
/// them. Sends after end fail with [`MuxError::ConnectionClosed`].
#[derive(Clone)]
pub struct StreamSender {
    id: i32,
    shared: Arc<Shared>,
}

impl StreamSender {
    pub(crate) fn new(id: i32, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    /// Send the next value.
    pub async fn send(&self, value: impl Into<BodyValue>) -> Result<()> {
        self.shared.stream_send(self.id, value.into()).await
    }

    /// Serialize a value to JSON and send it.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let v = serde_json::to_value(value)?;
        self.send(BodyValue::Json(v)).await
    }

    /// End this direction cleanly.
    pub async fn end(&self) -> Result<()> {
        self.shared.stream_local_end(self.id, None).await
    }

    /// End this direction with an in-band error.
    pub async fn end_with_error(&self, err: CallError) -> Result<()> {
        self.shared.stream_local_end(self.id, Some(err)).await
    }
}

impl std::fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender").field("id", &self.id).finish()
    }
}
