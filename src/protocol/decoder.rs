//! Packet decoder for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a state
//! machine for handling fragmented packets:
//! - `WaitingForHeader`: need at least 9 bytes
//! - `WaitingForBody`: header parsed, need N more body bytes
//! - `Finished`: goodbye seen or a framing error occurred; no further
//!   input is accepted
//!
//! The goodbye sentinel (9 zero bytes) is checked before generic header
//! parsing; it can never collide with a valid header because real packet
//! ids are nonzero.

use bytes::{Bytes, BytesMut};

use super::packet::Packet;
use super::wire::{Header, DEFAULT_MAX_BODY_SIZE, GOODBYE, HEADER_SIZE};
use crate::error::{MuxError, Result};

/// One decoded unit from the byte stream.
#[derive(Debug, Clone)]
pub enum Decoded {
    /// A complete packet.
    Packet(Packet),
    /// The goodbye sentinel: connection-level termination.
    Goodbye,
}

/// State machine for packet parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 9 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForBody { header: Header },
    /// Goodbye seen or framing error: decoding is over.
    Finished,
}

/// Buffer for accumulating incoming bytes and extracting complete packets.
pub struct PacketDecoder {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed body size.
    max_body_size: u32,
}

impl PacketDecoder {
    /// Create a new decoder with the default body-size cap.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new decoder with a custom body-size cap.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_body_size,
        }
    }

    /// Push data into the buffer and extract everything complete.
    ///
    /// Returns the decoded packets, in order, with a trailing
    /// [`Decoded::Goodbye`] if the sentinel was reached. Partial data is
    /// buffered internally for the next push. After goodbye, further
    /// pushes return empty; after a framing error, further pushes repeat
    /// the failure.
    ///
    /// # Errors
    ///
    /// Returns a [`MuxError::Framing`] error on a malformed header or a
    /// body length over the cap. Framing errors are fatal: the decoder
    /// stays poisoned.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Decoded>> {
        if matches!(self.state, State::Finished) {
            // Bytes after goodbye are not parsed.
            return Ok(Vec::new());
        }

        self.buffer.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            match self.try_extract_one() {
                Ok(Some(item)) => {
                    let is_goodbye = matches!(item, Decoded::Goodbye);
                    out.push(item);
                    if is_goodbye {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.state = State::Finished;
                    return Err(e);
                }
            }
        }

        Ok(out)
    }

    /// Try to extract a single unit from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed.
    fn try_extract_one(&mut self) -> Result<Option<Decoded>> {
        match &self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                // Sentinel check comes before header parsing.
                if self.buffer[..HEADER_SIZE] == GOODBYE {
                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::Finished;
                    return Ok(Some(Decoded::Goodbye));
                }

                let header = Header::decode(&self.buffer[..HEADER_SIZE])
                    .expect("buffer has enough bytes");
                header.validate(self.max_body_size)?;

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.body_len == 0 {
                    return Ok(Some(Decoded::Packet(Packet::new(
                        header.flags,
                        header.id,
                        Bytes::new(),
                    ))));
                }

                self.state = State::WaitingForBody { header };
                self.try_extract_one()
            }

            State::WaitingForBody { header } => {
                let want = header.body_len as usize;
                if self.buffer.len() < want {
                    return Ok(None);
                }

                let body = self.buffer.split_to(want).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;

                Ok(Some(Decoded::Packet(Packet::new(
                    header.flags,
                    header.id,
                    body,
                ))))
            }

            State::Finished => Ok(None),
        }
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the decoder has reached its terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
            State::Finished => "Finished",
        }
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}
