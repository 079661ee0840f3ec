//! NegotiateUseCase: turns local user commands into negotiation messages.
//!
//! The use case reads the current [`NegotiationSession`] through a
//! [`NegotiationChannel`], checks that the local side may act, builds the
//! message with the right terms and cycle, and hands it to the channel for
//! sending.
//!
//! # Architecture
//!
//! The use case depends only on the [`NegotiationChannel`] trait.  The
//! infrastructure implementation is the TCP-backed `PeerSession`; tests use a
//! recording double.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use trade_core::{MessageKind, NegotiationMessage, NegotiationSession, Outcome, Role, Terms};

/// Error type for the negotiate use case.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiateError {
    /// The command line could not be understood.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A counter offer needs both a price and an amount.
    #[error("usage: counter <price> <amount>")]
    IncompleteTerms,

    /// The peer holds the turn.
    #[error("it is not your turn")]
    NotYourTurn,

    /// Only the buyer opens a negotiation, and only once.
    #[error("an intent can only be sent by the buyer before negotiation starts")]
    IntentNotAllowed,

    /// The negotiation already ended.
    #[error("negotiation already ended ({0:?})")]
    Finished(Outcome),

    /// The channel could not deliver the message.
    #[error("send failed: {0}")]
    Send(String),
}

/// A local user action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Propose new terms.
    Counter(Terms),
    /// Accept the terms on the table.
    Accept,
    /// Reject the terms on the table.
    Reject,
    /// Leave the negotiation.
    Quit,
}

impl Command {
    /// Parses one line of interactive input: `counter <price> <amount>`,
    /// `accept`, `reject`, or `quit`.
    ///
    /// # Errors
    ///
    /// [`NegotiateError::IncompleteTerms`] for a counter without both terms,
    /// [`NegotiateError::UnknownCommand`] for anything else.
    pub fn parse(line: &str) -> Result<Self, NegotiateError> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_lowercase();
        match verb.as_str() {
            "counter" | "c" => match (words.next(), words.next()) {
                (Some(price), Some(amount)) => Ok(Command::Counter(Terms::new(price, amount))),
                _ => Err(NegotiateError::IncompleteTerms),
            },
            "accept" | "a" => Ok(Command::Accept),
            "reject" | "r" => Ok(Command::Reject),
            "quit" | "q" | "resign" => Ok(Command::Quit),
            _ => Err(NegotiateError::UnknownCommand(line.trim().to_string())),
        }
    }
}

/// Builds the message for `command` from the local side of `session`.
///
/// # Errors
///
/// [`NegotiateError::Finished`] once the session is terminal and
/// [`NegotiateError::NotYourTurn`] when the peer holds the turn.  Quitting is
/// always allowed before the end.
pub fn build_message(
    session: &NegotiationSession,
    command: &Command,
) -> Result<NegotiationMessage, NegotiateError> {
    if let Some(outcome) = session.outcome() {
        return Err(NegotiateError::Finished(outcome));
    }
    let me = session.local_identity();
    let cycle = session.cycle();

    let message = match command {
        Command::Quit => NegotiationMessage::resign(session.listing().terms(), me, cycle),
        _ if !session.turn_ready() => return Err(NegotiateError::NotYourTurn),
        Command::Counter(terms) if !terms.is_complete() => {
            return Err(NegotiateError::IncompleteTerms)
        }
        Command::Counter(terms) => {
            NegotiationMessage::counter(terms.clone(), me, cycle.saturating_add(1))
        }
        Command::Accept => NegotiationMessage::accept(session.active_terms().clone(), me, cycle),
        Command::Reject => NegotiationMessage::reject(session.active_terms().clone(), me, cycle),
    };
    Ok(message)
}

/// Builds the buyer's opening message.
///
/// # Errors
///
/// [`NegotiateError::IntentNotAllowed`] unless the local side is the buyer and
/// no intent has been applied yet.
pub fn build_intent(session: &NegotiationSession) -> Result<NegotiationMessage, NegotiateError> {
    if session.role() != Role::Buyer || !session.history().is_empty() {
        return Err(NegotiateError::IntentNotAllowed);
    }
    Ok(NegotiationMessage::buyer_intent(
        session.listing(),
        session.local_identity(),
    ))
}

/// Summary the local side owes after applying `received`.
///
/// The side that did not accept echoes the settled terms, exactly once.
pub fn summary_reply(
    session: &NegotiationSession,
    received: &NegotiationMessage,
) -> Option<NegotiationMessage> {
    let accepted_by_peer = received.kind == MessageKind::Accept
        && session.sender_role(received) != session.role()
        && session.outcome() == Some(Outcome::Accepted);
    let already_sent = session
        .history()
        .iter()
        .any(|m| m.kind == MessageKind::Summary && m.proponent == session.local_identity());
    if !accepted_by_peer || already_sent {
        return None;
    }
    debug!("peer accepted; sending summary");
    Some(NegotiationMessage::summary(
        session.active_terms().clone(),
        session.local_identity(),
        session.cycle(),
    ))
}

// ── Use case ──────────────────────────────────────────────────────────────────

/// Read/send access to one live negotiation.
#[async_trait]
pub trait NegotiationChannel: Send + Sync {
    /// A copy of the current session state.
    async fn session(&self) -> NegotiationSession;

    /// Sends `message` to the peer and applies it locally.
    async fn send(&self, message: NegotiationMessage) -> Result<(), String>;
}

/// Executes user commands against a [`NegotiationChannel`].
pub struct NegotiateUseCase {
    channel: Arc<dyn NegotiationChannel>,
}

impl NegotiateUseCase {
    pub fn new(channel: Arc<dyn NegotiationChannel>) -> Self {
        Self { channel }
    }

    /// Sends the buyer's intent.
    pub async fn open(&self) -> Result<NegotiationMessage, NegotiateError> {
        let session = self.channel.session().await;
        let message = build_intent(&session)?;
        self.deliver(message).await
    }

    /// Builds and sends the message for `command`.
    pub async fn execute(&self, command: &Command) -> Result<NegotiationMessage, NegotiateError> {
        let session = self.channel.session().await;
        let message = build_message(&session, command)?;
        self.deliver(message).await
    }

    async fn deliver(
        &self,
        message: NegotiationMessage,
    ) -> Result<NegotiationMessage, NegotiateError> {
        self.channel
            .send(message.clone())
            .await
            .map_err(NegotiateError::Send)?;
        Ok(message)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use trade_core::Listing;

    const SELLER: &str = "alice";
    const BUYER: &str = "bob";

    fn listing() -> Listing {
        Listing::new(SELLER, "49000", "1")
    }

    // ── Test doubles ──────────────────────────────────────────────────────────

    /// Applies sent messages to an in-memory session and records them.
    struct RecordingChannel {
        session: Mutex<NegotiationSession>,
        sent: Mutex<Vec<NegotiationMessage>>,
        should_fail: bool,
    }

    impl RecordingChannel {
        fn new(session: NegotiationSession) -> Self {
            Self {
                session: Mutex::new(session),
                sent: Mutex::new(Vec::new()),
                should_fail: false,
            }
        }
    }

    #[async_trait]
    impl NegotiationChannel for RecordingChannel {
        async fn session(&self) -> NegotiationSession {
            self.session.lock().unwrap().clone()
        }

        async fn send(&self, message: NegotiationMessage) -> Result<(), String> {
            if self.should_fail {
                return Err("injected failure".to_string());
            }
            self.session.lock().unwrap().apply(message.clone());
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    // ── Command parsing ───────────────────────────────────────────────────────

    #[test]
    fn test_parse_counter_with_terms() {
        assert_eq!(
            Command::parse("counter 48000 0.5"),
            Ok(Command::Counter(Terms::new("48000", "0.5")))
        );
    }

    #[test]
    fn test_parse_counter_without_amount_is_incomplete() {
        assert_eq!(Command::parse("counter 48000"), Err(NegotiateError::IncompleteTerms));
    }

    #[test]
    fn test_parse_short_forms_and_case() {
        assert_eq!(Command::parse("  ACCEPT "), Ok(Command::Accept));
        assert_eq!(Command::parse("r"), Ok(Command::Reject));
        assert_eq!(Command::parse("quit"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_unknown_command() {
        assert!(matches!(
            Command::parse("haggle"),
            Err(NegotiateError::UnknownCommand(_))
        ));
    }

    // ── Message building ──────────────────────────────────────────────────────

    #[test]
    fn test_counter_uses_next_cycle() {
        // Arrange
        let mut session = NegotiationSession::new(listing(), SELLER);
        session.apply(NegotiationMessage::buyer_intent(&listing(), BUYER));

        // Act
        let msg = build_message(&session, &Command::Counter(Terms::new("48000", "1"))).unwrap();

        // Assert
        assert_eq!(msg.kind, MessageKind::Counter);
        assert_eq!(msg.cycle, 1);
        assert_eq!(msg.proponent, SELLER);
        assert_eq!(msg.terms(), Terms::new("48000", "1"));
    }

    #[test]
    fn test_counter_after_maximal_peer_cycle_saturates() {
        // Arrange: the buyer answers with the largest representable cycle.
        let mut session = NegotiationSession::new(listing(), SELLER);
        session.apply(NegotiationMessage::buyer_intent(&listing(), BUYER));
        session.apply(NegotiationMessage::counter(Terms::new("48500", "1"), SELLER, 1));
        session.apply(NegotiationMessage::counter(
            Terms::new("47500", "1"),
            BUYER,
            u32::MAX,
        ));
        assert_eq!(session.cycle(), u32::MAX);

        // Act
        let msg = build_message(&session, &Command::Counter(Terms::new("48000", "1"))).unwrap();

        // Assert
        assert_eq!(msg.cycle, u32::MAX);
    }

    #[test]
    fn test_accept_carries_active_terms() {
        let mut session = NegotiationSession::new(listing(), SELLER);
        session.apply(NegotiationMessage::buyer_intent(&listing(), BUYER));

        let msg = build_message(&session, &Command::Accept).unwrap();

        assert_eq!(msg.kind, MessageKind::Accept);
        assert_eq!(msg.terms(), Terms::new("49000", "1"));
    }

    #[test]
    fn test_acting_out_of_turn_is_refused() {
        let mut session = NegotiationSession::new(listing(), BUYER);
        session.apply(NegotiationMessage::buyer_intent(&listing(), BUYER));

        assert_eq!(
            build_message(&session, &Command::Accept),
            Err(NegotiateError::NotYourTurn)
        );
    }

    #[test]
    fn test_quit_is_allowed_out_of_turn() {
        let session = NegotiationSession::new(listing(), BUYER);
        let msg = build_message(&session, &Command::Quit).unwrap();
        assert_eq!(msg.kind, MessageKind::Resign);
    }

    #[test]
    fn test_commands_after_end_are_refused() {
        let mut session = NegotiationSession::new(listing(), SELLER);
        session.apply(NegotiationMessage::resign(Terms::default(), BUYER, 0));
        assert_eq!(
            build_message(&session, &Command::Quit),
            Err(NegotiateError::Finished(Outcome::Resigned))
        );
    }

    #[test]
    fn test_intent_only_from_fresh_buyer() {
        let seller = NegotiationSession::new(listing(), SELLER);
        assert_eq!(build_intent(&seller), Err(NegotiateError::IntentNotAllowed));

        let buyer = NegotiationSession::new(listing(), BUYER);
        let intent = build_intent(&buyer).unwrap();
        assert_eq!(intent.kind, MessageKind::Intent);
        assert_eq!(intent.terms(), listing().terms());
    }

    // ── Summary reply ─────────────────────────────────────────────────────────

    #[test]
    fn test_summary_is_owed_by_the_non_acceptor() {
        // Arrange
        let mut seller = NegotiationSession::new(listing(), SELLER);
        seller.apply(NegotiationMessage::buyer_intent(&listing(), BUYER));
        seller.apply(NegotiationMessage::counter(Terms::new("48000", "1"), SELLER, 1));
        let accept = NegotiationMessage::accept(Terms::new("48000", "1"), BUYER, 1);
        seller.apply(accept.clone());

        // Act
        let summary = summary_reply(&seller, &accept).expect("seller owes a summary");

        // Assert
        assert_eq!(summary.kind, MessageKind::Summary);
        assert_eq!(summary.terms(), Terms::new("48000", "1"));
        assert_eq!(summary.proponent, SELLER);

        seller.apply(summary);
        assert_eq!(summary_reply(&seller, &accept), None, "summary is sent once");
    }

    #[test]
    fn test_acceptor_owes_no_summary() {
        let mut seller = NegotiationSession::new(listing(), SELLER);
        seller.apply(NegotiationMessage::buyer_intent(&listing(), BUYER));
        let accept = NegotiationMessage::accept(Terms::default(), SELLER, 0);
        seller.apply(accept.clone());

        assert_eq!(summary_reply(&seller, &accept), None);
    }

    // ── Use case ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_use_case_opens_and_counters() {
        // Arrange
        let channel = Arc::new(RecordingChannel::new(NegotiationSession::new(listing(), BUYER)));
        let uc = NegotiateUseCase::new(channel.clone());

        // Act
        uc.open().await.unwrap();
        channel
            .session
            .lock()
            .unwrap()
            .apply(NegotiationMessage::counter(Terms::new("48000", "1"), SELLER, 1));
        uc.execute(&Command::Counter(Terms::new("48500", "1")))
            .await
            .unwrap();

        // Assert
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, MessageKind::Intent);
        assert_eq!(sent[1].cycle, 2);
    }

    #[tokio::test]
    async fn test_use_case_surfaces_send_failure() {
        let mut channel = RecordingChannel::new(NegotiationSession::new(listing(), BUYER));
        channel.should_fail = true;
        let uc = NegotiateUseCase::new(Arc::new(channel));

        let result = uc.open().await;

        assert_eq!(result, Err(NegotiateError::Send("injected failure".to_string())));
    }
}
