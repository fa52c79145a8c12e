//! Protocol module - wire format, framing, and packet types.
//!
//! Pure framing, no protocol semantics:
//! - 9-byte header encoding/decoding and the goodbye sentinel
//! - Packet struct with typed accessors
//! - Resumable decoder for accumulating partial reads

mod decoder;
mod packet;
mod wire;

pub use decoder::{Decoded, PacketDecoder};
pub use packet::{build_packet, Packet};
pub use wire::{flags, BodyType, Header, DEFAULT_MAX_BODY_SIZE, GOODBYE, HEADER_SIZE};
