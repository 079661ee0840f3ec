//! trade-peer library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does trade-peer do? (for beginners)
//!
//! A *peer* is one participant in a LAN trade.  The same program plays both
//! parts:
//!
//! 1. A **seller** publishes a listing (name, price, amount) by announcing it
//!    over UDP, then waits for a buyer to open a TCP connection.
//! 2. A **buyer** browses the announcements, picks a listing, connects to the
//!    seller, and sends an *intent*.
//! 3. Both sides then exchange counter offers until one accepts, rejects, or
//!    resigns.  The wire format and the negotiation rules live in
//!    `trade-core`; this crate supplies sockets, settings, balances, and the
//!    command-line interface.

/// Application layer: negotiation commands and balance bookkeeping.
pub mod application;

/// Infrastructure layer: network transport, discovery, and preference storage.
pub mod infrastructure;
