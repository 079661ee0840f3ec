//! Negotiation session state machine.
//!
//! A [`NegotiationSession`] interprets an ordered sequence of
//! [`NegotiationMessage`]s, both the ones sent locally and the ones received
//! from the peer, and derives the state a user interface needs:
//!
//! - which side we are on ([`Role`]),
//! - the terms currently on the table and the round ([`cycle`](NegotiationSession::cycle)),
//! - whether the local side may act now,
//! - the terminal [`Outcome`] once the negotiation is over.
//!
//! # Lifecycle
//!
//! ```text
//! AwaitingIntent ──Intent──► Offered ──Counter──► Countering ──Counter──┐
//!        │                     │                     │  ▲────────────────┘
//!        │                     ├─Accept/Reject───────┤
//!        │                     ▼                     ▼
//!        └──────Resign──► Terminal(Accepted | Rejected | Resigned)
//! ```
//!
//! Messages are applied strictly in the order they are handed in.  Every
//! message is appended to the history, including the ones that are not valid
//! for the current phase; those are reported as a [`ProtocolViolation`] and
//! cause no transition.
//!
//! # Turn validation
//!
//! The author of each message is mapped to a role by comparing its
//! `proponent` with the local identity.  A counter, accept, or reject from the
//! side that does not hold the turn is a violation, as is an intent authored by
//! the seller.

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::messages::{Listing, MessageKind, NegotiationMessage, Terms};

/// Which side of the listing the local peer is on.  Fixed for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns the listing.
    Seller,
    /// Responds to someone else's listing.
    Buyer,
}

impl Role {
    /// The counterpart role.
    pub fn other(self) -> Role {
        match self {
            Role::Seller => Role::Buyer,
            Role::Buyer => Role::Seller,
        }
    }
}

/// How a negotiation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Accepted,
    Rejected,
    Resigned,
}

/// Phase of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No intent has been declared yet.
    AwaitingIntent,
    /// The listing's terms are on the table.
    Offered,
    /// At least one counter offer has been made.
    Countering,
    /// The negotiation is over.
    Terminal(Outcome),
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Terminal(_))
    }

    fn is_open(self) -> bool {
        matches!(self, Phase::Offered | Phase::Countering)
    }
}

/// A message that was recorded but could not be applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The kind is not valid in the current phase (e.g. a second intent).
    #[error("{kind} is not valid while {phase:?}")]
    UnexpectedKind { kind: &'static str, phase: Phase },

    /// Only the buyer may declare an intent.
    #[error("intent authored by the seller")]
    IntentFromSeller,

    /// The author does not hold the turn.
    #[error("{sender:?} acted while the turn belongs to {expected:?}")]
    NotYourTurn { sender: Role, expected: Role },

    /// The session already reached a terminal outcome.
    #[error("negotiation already ended ({0:?})")]
    AlreadyTerminal(Outcome),

    /// The message kind code is unknown to this build.
    #[error("unrecognized message kind {0}")]
    UnrecognizedKind(i64),
}

/// What applying a single message did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The state machine moved.
    Advanced,
    /// Informational message; recorded without a transition.
    Recorded,
    /// Recorded for audit; no transition.
    Violation(ProtocolViolation),
    /// The session resigned; the owner should tear down the connection.
    Teardown,
}

/// Point-in-time copy of a session, safe to hand to a presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub role: Role,
    pub phase: Phase,
    pub cycle: u32,
    pub active_terms: Terms,
    pub turn_ready: bool,
    pub outcome: Option<Outcome>,
    pub history: Vec<NegotiationMessage>,
}

/// Per-connection negotiation state.
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    local_identity: String,
    listing: Listing,
    role: Role,
    phase: Phase,
    cycle: u32,
    active: Terms,
    turn: Option<Role>,
    history: Vec<NegotiationMessage>,
    /// History index of the accept that ended the session.
    accepted_at: Option<usize>,
}

impl NegotiationSession {
    /// Creates a session for `listing` as seen by `local_identity`.
    ///
    /// The local side is the seller when it owns the listing, the buyer otherwise.
    pub fn new(listing: Listing, local_identity: impl Into<String>) -> Self {
        let local_identity = local_identity.into();
        let role = if listing.name == local_identity {
            Role::Seller
        } else {
            Role::Buyer
        };
        Self {
            local_identity,
            listing,
            role,
            phase: Phase::AwaitingIntent,
            cycle: 0,
            active: Terms::default(),
            turn: None,
            history: Vec::new(),
            accepted_at: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn listing(&self) -> &Listing {
        &self.listing
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// Terms currently on the table.  Empty before the intent.
    pub fn active_terms(&self) -> &Terms {
        &self.active
    }

    /// Role that must act next, if any.
    pub fn turn(&self) -> Option<Role> {
        self.turn
    }

    /// `true` when the local side may act.
    pub fn turn_ready(&self) -> bool {
        self.turn == Some(self.role)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.phase {
            Phase::Terminal(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Every applied message in arrival/send order.
    pub fn history(&self) -> &[NegotiationMessage] {
        &self.history
    }

    /// Role of the author of `message`.
    pub fn sender_role(&self, message: &NegotiationMessage) -> Role {
        if message.proponent == self.local_identity {
            self.role
        } else {
            self.role.other()
        }
    }

    /// Final terms, once the session was accepted and a summary followed.
    pub fn settlement(&self) -> Option<&Terms> {
        let accepted_at = self.accepted_at?;
        self.history[accepted_at + 1..]
            .iter()
            .any(|m| m.kind == MessageKind::Summary)
            .then_some(&self.active)
    }

    /// Copies the current state.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            role: self.role,
            phase: self.phase,
            cycle: self.cycle,
            active_terms: self.active.clone(),
            turn_ready: self.turn_ready(),
            outcome: self.outcome(),
            history: self.history.clone(),
        }
    }

    /// Applies one message and appends it to the history.
    pub fn apply(&mut self, message: NegotiationMessage) -> Transition {
        let transition = self.transition_for(&message);
        match &transition {
            Transition::Violation(violation) => warn!(
                id = %message.id,
                kind = message.kind.name(),
                proponent = %message.proponent,
                "protocol violation recorded: {violation}"
            ),
            other => debug!(
                id = %message.id,
                kind = message.kind.name(),
                cycle = self.cycle,
                "applied negotiation message: {other:?}"
            ),
        }
        self.history.push(message);
        transition
    }

    fn transition_for(&mut self, message: &NegotiationMessage) -> Transition {
        if let Phase::Terminal(outcome) = self.phase {
            return match message.kind {
                MessageKind::Summary => Transition::Recorded,
                _ => Transition::Violation(ProtocolViolation::AlreadyTerminal(outcome)),
            };
        }

        let sender = self.sender_role(message);
        match message.kind {
            MessageKind::Intent => {
                if sender != Role::Buyer {
                    return Transition::Violation(ProtocolViolation::IntentFromSeller);
                }
                if self.phase != Phase::AwaitingIntent {
                    return self.unexpected(message.kind);
                }
                self.active = self.listing.terms();
                self.cycle = 0;
                self.phase = Phase::Offered;
                self.turn = Some(Role::Seller);
                Transition::Advanced
            }
            MessageKind::Counter | MessageKind::Accept | MessageKind::Reject => {
                if !self.phase.is_open() {
                    return self.unexpected(message.kind);
                }
                if let Some(expected) = self.turn {
                    if sender != expected {
                        return Transition::Violation(ProtocolViolation::NotYourTurn {
                            sender,
                            expected,
                        });
                    }
                }
                match message.kind {
                    MessageKind::Counter => {
                        self.active = message.terms();
                        self.cycle = self.cycle.saturating_add(1).max(message.cycle);
                        self.phase = Phase::Countering;
                        self.turn = Some(sender.other());
                    }
                    MessageKind::Accept => {
                        self.accepted_at = Some(self.history.len());
                        self.finish(Outcome::Accepted);
                    }
                    _ => self.finish(Outcome::Rejected),
                }
                Transition::Advanced
            }
            MessageKind::Resign => {
                self.finish(Outcome::Resigned);
                Transition::Teardown
            }
            MessageKind::Summary => Transition::Recorded,
            MessageKind::Unrecognized(code) => {
                Transition::Violation(ProtocolViolation::UnrecognizedKind(code))
            }
        }
    }

    fn unexpected(&self, kind: MessageKind) -> Transition {
        Transition::Violation(ProtocolViolation::UnexpectedKind {
            kind: kind.name(),
            phase: self.phase,
        })
    }

    fn finish(&mut self, outcome: Outcome) {
        self.phase = Phase::Terminal(outcome);
        self.turn = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
