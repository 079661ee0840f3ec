//! Application layer use cases for a trade peer.
//!
//! - **`negotiate`** – Turns local user commands (`counter`, `accept`,
//!   `reject`, `quit`) into negotiation messages, after checking that the
//!   local side holds the turn.  Messages are sent through the
//!   `NegotiationChannel` trait, which the infrastructure layer implements.
//!
//! - **`wallet`** – Reserves balance for open offers and books settled trades
//!   through the `BalanceStore` trait.

pub mod negotiate;
pub mod wallet;
