//! Infrastructure layer for a trade peer.
//!
//! **Dependency rule**: this layer may depend on `application` and `trade_core`,
//! but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`network`** – TCP transport with a passcode preamble, UDP listing
//!   discovery, and the `PeerSession` adapter that runs the receive loop for a
//!   negotiation connection.
//!
//! - **`storage`** – TOML persistence of user preferences and balances.

pub mod network;
pub mod storage;
