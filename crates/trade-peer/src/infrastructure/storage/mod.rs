//! Persistent storage for a trade peer.

pub mod config;
