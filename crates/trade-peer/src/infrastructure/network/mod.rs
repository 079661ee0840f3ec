//! Network infrastructure for a trade peer.

pub mod adapter;
pub mod discovery;
pub mod transport;

pub use adapter::{AdapterConfig, PeerSession, SessionEvent};
pub use discovery::{browse, publish, Announcement, DiscoveredListing, DiscoveryError, Publisher};
pub use transport::{connect, PeerListener, TransportError};
