//! Application message model carried inside frames.
//!
//! A [`NegotiationMessage`] is serialized as a field-keyed JSON object:
//!
//! ```text
//! {"id":"…","proponent":"alice","price":"48000","amount":"1","type":3,"cycle":2,"version":1}
//! ```
//!
//! Decoding is deliberately permissive.  Peers at different revisions may add or
//! drop fields, so unknown keys are ignored and missing or garbled values fall
//! back to the zero value of their type.  [`NegotiationMessage::from_payload`]
//! therefore never fails; a broken payload yields a best-effort record instead
//! of tearing down the connection.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Revision of the negotiation payload written by this build.
pub const PAYLOAD_VERSION: u32 = 1;

// ── Frame type codes ──────────────────────────────────────────────────────────

/// Message type codes carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum MessageType {
    /// Reserved; never sent by a well-behaved peer.
    Invalid = 0,
    /// Payload is a JSON-encoded [`NegotiationMessage`].
    Negotiation = 1,
}

impl TryFrom<u32> for MessageType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, ()> {
        match value {
            0 => Ok(MessageType::Invalid),
            1 => Ok(MessageType::Negotiation),
            _ => Err(()),
        }
    }
}

// ── Message kinds ─────────────────────────────────────────────────────────────

/// Kind of a negotiation turn.
///
/// The same type is used for the `type` code on the wire and as the key of the
/// negotiation state machine, so the code mapping lives only here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Buyer declares interest in a listing.  Code `0`, the zero value of the
    /// wire field.
    #[default]
    Intent,
    /// Current terms are accepted.
    Accept,
    /// Current terms are rejected.
    Reject,
    /// New terms are proposed.
    Counter,
    /// Sender leaves the negotiation.
    Resign,
    /// Informational echo of the settled terms.
    Summary,
    /// A code this build does not know about.
    Unrecognized(i64),
}

impl MessageKind {
    /// Integer code used in the `type` field.
    pub fn code(self) -> i64 {
        match self {
            MessageKind::Intent => 0,
            MessageKind::Accept => 1,
            MessageKind::Reject => 2,
            MessageKind::Counter => 3,
            MessageKind::Resign => 4,
            MessageKind::Summary => 5,
            MessageKind::Unrecognized(code) => code,
        }
    }

    /// Maps a wire code to a kind.  Never fails.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MessageKind::Intent,
            1 => MessageKind::Accept,
            2 => MessageKind::Reject,
            3 => MessageKind::Counter,
            4 => MessageKind::Resign,
            5 => MessageKind::Summary,
            other => MessageKind::Unrecognized(other),
        }
    }

    /// Short lowercase name for logs.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Intent => "intent",
            MessageKind::Accept => "accept",
            MessageKind::Reject => "reject",
            MessageKind::Counter => "counter",
            MessageKind::Resign => "resign",
            MessageKind::Summary => "summary",
            MessageKind::Unrecognized(_) => "unrecognized",
        }
    }
}

// ── Terms ─────────────────────────────────────────────────────────────────────

/// A price/amount pair.  Both are decimal text; empty means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terms {
    pub price: String,
    pub amount: String,
}

impl Terms {
    pub fn new(price: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            price: price.into(),
            amount: amount.into(),
        }
    }

    /// `true` when neither field is blank.
    pub fn is_complete(&self) -> bool {
        !self.price.trim().is_empty() && !self.amount.trim().is_empty()
    }
}

impl fmt::Display for Terms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BTC{} @ USD{}", self.amount, self.price)
    }
}

// ── Listing ───────────────────────────────────────────────────────────────────

/// A published offer.  `name` doubles as the publisher's display identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub amount: String,
}

impl Listing {
    pub fn new(
        name: impl Into<String>,
        price: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            price: price.into(),
            amount: amount.into(),
        }
    }

    /// Terms currently advertised by this listing.
    pub fn terms(&self) -> Terms {
        Terms::new(self.price.clone(), self.amount.clone())
    }

    /// Permissively reads a listing out of a JSON value.
    pub fn from_json(value: &Value) -> Self {
        Self {
            name: text_field(value, "name"),
            price: text_field(value, "price"),
            amount: text_field(value, "amount"),
        }
    }

    /// Permissively parses a listing from JSON text; non-JSON yields an empty listing.
    pub fn from_json_str(text: &str) -> Self {
        let value = serde_json::from_str::<Value>(text).unwrap_or(Value::Null);
        Self::from_json(&value)
    }
}

// ── Negotiation message ───────────────────────────────────────────────────────

/// One turn of a negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationMessage {
    /// Opaque unique token.  Diagnostics only; never used for ordering.
    pub id: String,
    /// Display identity of the author.
    pub proponent: String,
    pub kind: MessageKind,
    pub price: String,
    pub amount: String,
    /// Negotiation round the author believes it is in.
    pub cycle: u32,
    /// Payload revision of the author; `0` when absent.
    pub version: u32,
}

/// Borrowed view written to the wire.
#[derive(Serialize)]
struct WireRecord<'a> {
    id: &'a str,
    proponent: &'a str,
    price: &'a str,
    amount: &'a str,
    #[serde(rename = "type")]
    kind: i64,
    cycle: u32,
    version: u32,
}

impl NegotiationMessage {
    /// Builds a message with a fresh id.
    pub fn new(kind: MessageKind, terms: Terms, proponent: impl Into<String>, cycle: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            proponent: proponent.into(),
            kind,
            price: terms.price,
            amount: terms.amount,
            cycle,
            version: PAYLOAD_VERSION,
        }
    }

    /// Buyer's opening message, carrying the listing's advertised terms.
    pub fn buyer_intent(listing: &Listing, proponent: impl Into<String>) -> Self {
        Self::new(MessageKind::Intent, listing.terms(), proponent, 0)
    }

    pub fn counter(terms: Terms, proponent: impl Into<String>, cycle: u32) -> Self {
        Self::new(MessageKind::Counter, terms, proponent, cycle)
    }

    pub fn accept(terms: Terms, proponent: impl Into<String>, cycle: u32) -> Self {
        Self::new(MessageKind::Accept, terms, proponent, cycle)
    }

    pub fn reject(terms: Terms, proponent: impl Into<String>, cycle: u32) -> Self {
        Self::new(MessageKind::Reject, terms, proponent, cycle)
    }

    pub fn resign(terms: Terms, proponent: impl Into<String>, cycle: u32) -> Self {
        Self::new(MessageKind::Resign, terms, proponent, cycle)
    }

    pub fn summary(terms: Terms, proponent: impl Into<String>, cycle: u32) -> Self {
        Self::new(MessageKind::Summary, terms, proponent, cycle)
    }

    /// Price and amount carried by this message.
    pub fn terms(&self) -> Terms {
        Terms::new(self.price.clone(), self.amount.clone())
    }

    /// Serializes this message to its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error; with plain string and integer
    /// fields this does not happen in practice.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&WireRecord {
            id: &self.id,
            proponent: &self.proponent,
            price: &self.price,
            amount: &self.amount,
            kind: self.kind.code(),
            cycle: self.cycle,
            version: self.version,
        })
    }

    /// Decodes a payload into a best-effort message.  Never fails.
    pub fn from_payload(payload: &[u8]) -> Self {
        let text = decode_text(payload);
        let value = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);
        Self::from_json(&value)
    }

    /// Reads a message out of a JSON value, defaulting every missing field.
    pub fn from_json(value: &Value) -> Self {
        Self {
            id: text_field(value, "id"),
            proponent: text_field(value, "proponent"),
            kind: MessageKind::from_code(int_field(value, "type")),
            price: text_field(value, "price"),
            amount: text_field(value, "amount"),
            cycle: non_negative(int_field(value, "cycle")),
            version: non_negative(int_field(value, "version")),
        }
    }
}

// ── Permissive field readers ──────────────────────────────────────────────────

/// Reads `key` as text.  Numbers and booleans are stringified; anything else is empty.
fn text_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Reads `key` as an integer.  Numeric strings are parsed; anything else is 0.
fn int_field(value: &Value, key: &str) -> i64 {
    match value.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        Some(Value::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

fn non_negative(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

/// Turns payload bytes into text.
///
/// UTF-16 payloads are recognised by their byte-order mark; everything else is
/// read as UTF-8 with invalid sequences replaced.
fn decode_text(payload: &[u8]) -> String {
    match payload {
        [0xFF, 0xFE, rest @ ..] => utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(payload).into_owned(),
    }
}

fn utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
