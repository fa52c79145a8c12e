//! Packet struct with typed accessors and constructors.
//!
//! A packet is one framed unit on the wire: flags, a signed id, and a body.
//! Constructors cover the five shapes the protocol uses: call requests,
//! stream data, terminal responses, and the two stream-end forms (clean
//! close with body `true`, error close with an error object body).

use bytes::Bytes;
use serde::Serialize;

use super::wire::{flags, BodyType, Header, HEADER_SIZE};
use crate::error::{CallError, Result};

/// A complete protocol packet.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Flags byte (see [`flags`]).
    pub flags: u8,
    /// Signed id, nonzero. Positive ids belong to exchanges opened by the
    /// sender of the packet; the peer sees the same exchange negated.
    pub id: i32,
    /// Body bytes (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Packet {
    /// Create a packet from raw parts.
    pub fn new(flags: u8, id: i32, body: Bytes) -> Self {
        Self { flags, id, body }
    }

    /// Opening packet of a call: the JSON request envelope.
    ///
    /// Stream kinds carry the STREAM flag on their opening packet.
    pub fn request<T: Serialize>(id: i32, envelope: &T, stream: bool) -> Result<Self> {
        let body = serde_json::to_vec(envelope)?;
        let mut f = flags::JSON;
        if stream {
            f |= flags::STREAM;
        }
        Ok(Self::new(f, id, Bytes::from(body)))
    }

    /// Stream data packet carrying a typed body.
    pub fn data(id: i32, body_type: BodyType, body: Bytes) -> Self {
        Self::new(flags::STREAM | body_type.to_flags(), id, body)
    }

    /// Terminal response to a sync/async call.
    ///
    /// Body is either the success value or the in-band error object; both
    /// travel as JSON with the END flag set and STREAM clear.
    pub fn response(id: i32, body: Bytes) -> Self {
        Self::new(flags::JSON | flags::END, id, body)
    }

    /// Clean stream end: body is the JSON literal `true`.
    pub fn end_ok(id: i32, stream: bool) -> Self {
        let mut f = flags::JSON | flags::END;
        if stream {
            f |= flags::STREAM;
        }
        Self::new(f, id, Bytes::from_static(b"true"))
    }

    /// Error end: body is the serialized error object.
    pub fn end_err(id: i32, stream: bool, err: &CallError) -> Result<Self> {
        let body = serde_json::to_vec(err)?;
        let mut f = flags::JSON | flags::END;
        if stream {
            f |= flags::STREAM;
        }
        Ok(Self::new(f, id, Bytes::from(body)))
    }

    /// Header for this packet.
    pub fn header(&self) -> Header {
        Header::new(self.flags, self.body.len() as u32, self.id)
    }

    /// Check if this is a stream packet.
    #[inline]
    pub fn is_stream(&self) -> bool {
        flags::has_flag(self.flags, flags::STREAM)
    }

    /// Check if this is a terminal packet.
    #[inline]
    pub fn is_end(&self) -> bool {
        flags::has_flag(self.flags, flags::END)
    }

    /// Body type from the flag bits.
    ///
    /// Only valid on packets that came through [`validate`]d decoding or
    /// local constructors.
    ///
    /// [`validate`]: super::wire::Header::validate
    #[inline]
    pub fn body_type(&self) -> BodyType {
        BodyType::from_flags(self.flags).expect("validated flags")
    }

    /// Whether a terminal body signals a clean end.
    ///
    /// The wire convention is the JSON literal `true`; anything else on an
    /// END packet is an error body.
    #[inline]
    pub fn is_end_ok(&self) -> bool {
        self.body.as_ref() == b"true"
    }
}

/// Build a complete packet as a single byte vector (header + body).
pub fn build_packet(pkt: &Packet) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + pkt.body.len());
    buf.extend_from_slice(&pkt.header().encode());
    buf.extend_from_slice(&pkt.body);
    buf
}
