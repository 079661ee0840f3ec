//! Negotiation domain logic.
//!
//! Nothing in here touches sockets, files, or clocks.  The state machine is
//! driven purely by the messages handed to it, so it can be exercised from unit
//! tests without any transport.
//!
//! # How a negotiation unfolds (for beginners)
//!
//! A seller publishes a [`Listing`](crate::protocol::messages::Listing).  A
//! buyer connects and sends an *intent*, which puts the listing's terms on the
//! table.  From then on the two sides alternate: whoever holds the turn may
//! counter with new terms, accept the current terms, or reject them.  Either
//! side may resign at any time.  After an accept, the side that did not accept
//! sends a *summary* echoing the settled terms.

/// The per-connection negotiation state machine.
pub mod session;

/// Display strings for negotiation messages.
pub mod wording;
