//! Binary framing for the peer-to-peer trade channel.
//!
//! Wire format:
//! ```text
//! [message_type:4][payload_len:4][payload:N]
//! ```
//! Total header size: 8 bytes. Both header fields are big-endian.
//!
//! Two decoding entry points are provided:
//!
//! - [`decode_frame`] decodes one frame from the front of a slice and reports
//!   how many bytes it consumed (mirrors how a datagram or a fully buffered
//!   stream is handled).
//! - [`FrameDecoder`] is an incremental, pull-based parser for stream
//!   transports.  Bytes are pushed in whatever chunks the socket delivers and
//!   the decoder reports either a complete [`Frame`] or exactly how many more
//!   bytes it needs.
//!
//! Frames whose type code is not understood are still decoded structurally
//! (header and payload boundaries are respected) and surfaced as
//! [`Frame::Unrecognized`], so the stream never loses synchronisation.

use thiserror::Error;
use tracing::trace;

use crate::protocol::messages::MessageType;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The byte slice is shorter than a complete frame.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The payload is longer than the 32-bit length field can describe.
    #[error("payload of {0} bytes does not fit the 32-bit length field")]
    PayloadTooLarge(usize),
}

// ── Header ────────────────────────────────────────────────────────────────────

/// The 8-byte header prepended to every payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw message type code.  See [`MessageType`] for the known values.
    pub message_type: u32,
    /// Exact length of the payload that follows the header.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Serializes the header into its fixed 8-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.message_type.to_be_bytes());
        out[4..].copy_from_slice(&self.payload_length.to_be_bytes());
        out
    }

    /// Parses a header from the first 8 bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InsufficientData`] if fewer than 8 bytes are given.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::InsufficientData {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            message_type: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            payload_length: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One decoded application frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of a negotiation message (type code 1).
    Negotiation(Vec<u8>),
    /// Any other type code, including the reserved `0 = invalid`.
    Unrecognized { type_code: u32, payload: Vec<u8> },
}

impl Frame {
    /// Classifies a raw `(type_code, payload)` pair.
    pub fn new(type_code: u32, payload: Vec<u8>) -> Self {
        match MessageType::try_from(type_code) {
            Ok(MessageType::Negotiation) => Frame::Negotiation(payload),
            Ok(MessageType::Invalid) | Err(()) => Frame::Unrecognized { type_code, payload },
        }
    }

    /// Wire type code of this frame.
    pub fn type_code(&self) -> u32 {
        match self {
            Frame::Negotiation(_) => MessageType::Negotiation as u32,
            Frame::Unrecognized { type_code, .. } => *type_code,
        }
    }

    /// Payload bytes of this frame.
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Negotiation(payload) | Frame::Unrecognized { payload, .. } => payload,
        }
    }

    /// Encodes this frame including its header.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds `u32::MAX` bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_frame(self.type_code(), self.payload())
    }
}

// ── One-shot API ──────────────────────────────────────────────────────────────

/// Encodes `payload` behind an 8-byte header carrying `type_code`.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds `u32::MAX` bytes.
///
/// # Examples
///
/// ```rust
/// use trade_core::protocol::frame::{decode_frame, encode_frame, Frame};
///
/// let bytes = encode_frame(1, b"{}").unwrap();
/// let (frame, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(frame, Frame::Negotiation(b"{}".to_vec()));
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(type_code: u32, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let payload_length =
        u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

    let header = FrameHeader {
        message_type: type_code,
        payload_length,
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the total number of bytes consumed (header + payload)
/// so the caller can advance its read cursor.
///
/// # Errors
///
/// Returns [`FrameError::InsufficientData`] if `bytes` does not yet hold a
/// complete frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
    let header = FrameHeader::decode(bytes)?;
    let total = HEADER_SIZE + header.payload_length as usize;
    if bytes.len() < total {
        return Err(FrameError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }
    let payload = bytes[HEADER_SIZE..total].to_vec();
    Ok((Frame::new(header.message_type, payload), total))
}

// ── Incremental decoder ───────────────────────────────────────────────────────

/// Result of asking the [`FrameDecoder`] for its next frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A complete frame was extracted from the buffer.
    Frame(Frame),
    /// The decoder needs exactly this many more bytes to finish the current
    /// header or payload.
    NeedMore(usize),
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload(FrameHeader),
}

/// Pull-based stream decoder.
///
/// The decoder owns a growing buffer.  Callers [`push`](Self::push) whatever
/// bytes the transport produced and then call [`next_frame`](Self::next_frame)
/// until it reports [`DecodeStatus::NeedMore`].
///
/// A header is only interpreted once all 8 bytes are buffered, and a payload is
/// only emitted once all `payload_length` bytes are buffered, so the output is
/// identical no matter how the input was fragmented.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    state: State,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates an empty decoder waiting for its first header.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            state: State::WaitingForHeader,
        }
    }

    /// Appends received bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extracts the next complete frame, or reports how many bytes are missing.
    pub fn next_frame(&mut self) -> DecodeStatus {
        match self.state {
            State::WaitingForHeader => {
                let header = match FrameHeader::decode(&self.buffer) {
                    Ok(header) => header,
                    Err(_) => return DecodeStatus::NeedMore(HEADER_SIZE - self.buffer.len()),
                };
                self.buffer.drain(..HEADER_SIZE);
                trace!(
                    message_type = header.message_type,
                    payload_length = header.payload_length,
                    "frame header parsed"
                );
                self.state = State::WaitingForPayload(header);
                self.next_frame()
            }
            State::WaitingForPayload(header) => {
                let needed = header.payload_length as usize;
                if self.buffer.len() < needed {
                    return DecodeStatus::NeedMore(needed - self.buffer.len());
                }
                let payload: Vec<u8> = self.buffer.drain(..needed).collect();
                self.state = State::WaitingForHeader;
                DecodeStatus::Frame(Frame::new(header.message_type, payload))
            }
        }
    }

    /// Pushes `bytes` and drains every frame that became complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.push(bytes);
        let mut frames = Vec::new();
        while let DecodeStatus::Frame(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Header of the frame whose payload is currently being collected, if any.
    pub fn pending_header(&self) -> Option<FrameHeader> {
        match self.state {
            State::WaitingForHeader => None,
            State::WaitingForPayload(header) => Some(header),
        }
    }

    /// Number of bytes buffered but not yet part of an emitted frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// `true` when no partial header or payload is held.
    ///
    /// A stream that ends while this is `false` was truncated mid-frame.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForHeader)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
