//! # trade-core
//!
//! Shared library for LAN trade peers containing the length-prefixed wire
//! codec, the negotiation message model, and the negotiation state machine.
//!
//! It has no dependencies on sockets, service discovery, or user interfaces;
//! the `trade-peer` crate supplies those.
//!
//! # Architecture overview (for beginners)
//!
//! Two peers on the same network negotiate the price of a listing by exchanging
//! small JSON messages over a TCP stream.  This crate defines:
//!
//! - **`protocol`** – How bytes travel over the stream.  Every message is
//!   wrapped in a frame: an 8-byte header (type code + payload length, both
//!   big-endian `u32`) followed by the payload.  The incremental
//!   [`FrameDecoder`] reassembles frames from arbitrarily fragmented reads.
//!
//! - **`domain`** – The [`NegotiationSession`] state machine, which turns an
//!   ordered list of messages into "whose turn is it", "what is on the table",
//!   and "how did it end".

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `trade_core::NegotiationSession` instead of the full module path.
pub use domain::session::{
    NegotiationSession, Outcome, Phase, ProtocolViolation, Role, SessionSnapshot, Transition,
};
pub use domain::wording::{describe, offer_noun, role_label};
pub use protocol::frame::{
    decode_frame, encode_frame, DecodeStatus, Frame, FrameDecoder, FrameError, FrameHeader,
    HEADER_SIZE,
};
pub use protocol::messages::{
    Listing, MessageKind, MessageType, NegotiationMessage, Terms, PAYLOAD_VERSION,
};
