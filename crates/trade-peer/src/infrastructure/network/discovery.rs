//! UDP broadcast-based listing discovery.
//!
//! A seller announces its [`Listing`] by periodically sending a small JSON
//! datagram to the announce address (by default the LAN broadcast address on
//! the discovery port):
//!
//! ```text
//! {"listing":{"name":"alice","price":"49000","amount":"1"},"port":24800}
//! ```
//!
//! `port` is the TCP port on which the seller accepts negotiation connections.
//! Buyers bind the discovery port, parse every datagram they receive, and
//! combine the sender's IP address with the announced port to obtain the
//! address to connect to.
//!
//! # How UDP discovery works (for beginners)
//!
//! UDP is connectionless and unreliable: a datagram may be lost, duplicated, or
//! reordered.  That is acceptable here because announcements repeat every
//! `announce_interval`; a browser that misses one simply sees the next.  The
//! same property means a browser can see the same listing many times, so
//! callers de-duplicate by listing name.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};
use trade_core::Listing;

/// Largest announcement datagram read.
const MAX_DATAGRAM: usize = 2048;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A socket option or send failed.
    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The announcement could not be serialized.
    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The datagram body sent by a publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub listing: Listing,
    pub port: u16,
}

impl Announcement {
    /// Permissively parses a datagram.  Returns `None` when it carries no
    /// listing name or no usable port.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(datagram).ok()?;
        let listing = Listing::from_json(value.get("listing")?);
        let port = value.get("port")?.as_u64().and_then(|p| u16::try_from(p).ok())?;
        if listing.name.is_empty() || port == 0 {
            return None;
        }
        Some(Self { listing, port })
    }
}

/// A listing seen on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredListing {
    pub listing: Listing,
    /// TCP address of the publisher's negotiation listener.
    pub address: SocketAddr,
}

impl DiscoveredListing {
    /// Combines an announcement with the datagram's source address.
    pub fn from_announcement(announcement: Announcement, source: SocketAddr) -> Self {
        Self {
            listing: announcement.listing,
            address: SocketAddr::new(source.ip(), announcement.port),
        }
    }
}

// ── Publishing ────────────────────────────────────────────────────────────────

/// Handle to a running announcement task.
///
/// Dropping the handle stops the announcements, as does [`unpublish`](Self::unpublish).
pub struct Publisher {
    current: watch::Sender<Option<Announcement>>,
    task: JoinHandle<()>,
}

impl Publisher {
    /// Replaces the announced listing.  Takes effect immediately.
    pub fn publish_update(&self, listing: Listing) {
        self.current.send_modify(|current| {
            if let Some(announcement) = current {
                announcement.listing = listing;
            }
        });
    }

    /// The listing currently announced.
    pub fn listing(&self) -> Option<Listing> {
        self.current.borrow().as_ref().map(|a| a.listing.clone())
    }

    /// Stops announcing and waits for the task to finish.
    pub async fn unpublish(self) {
        self.current.send_replace(None);
        if let Err(e) = self.task.await {
            warn!("announcement task ended abnormally: {e}");
        }
    }
}

/// Starts announcing `listing` to `announce_addr` every `interval`.
///
/// # Errors
///
/// Returns [`DiscoveryError::BindFailed`] if no sending socket can be bound, or
/// [`DiscoveryError::Io`] if broadcast cannot be enabled on it.
pub async fn publish(
    listing: Listing,
    control_port: u16,
    announce_addr: SocketAddr,
    interval: Duration,
) -> Result<Publisher, DiscoveryError> {
    let bind: SocketAddr = if announce_addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|source| DiscoveryError::BindFailed { addr: bind, source })?;
    socket.set_broadcast(true)?;

    let announcement = Announcement {
        listing,
        port: control_port,
    };
    info!(
        "announcing listing '{}' to {announce_addr} every {interval:?}",
        announcement.listing.name
    );
    let (current, rx) = watch::channel(Some(announcement));
    let task = tokio::spawn(announce_loop(socket, announce_addr, interval, rx));
    Ok(Publisher { current, task })
}

async fn announce_loop(
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    mut rx: watch::Receiver<Option<Announcement>>,
) {
    let mut ticker = time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let datagram = match rx.borrow_and_update().as_ref() {
            Some(announcement) => serde_json::to_vec(announcement),
            None => break,
        };
        match datagram {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, target).await {
                    warn!("failed to send announcement to {target}: {e}");
                }
            }
            Err(e) => warn!("failed to encode announcement: {e}"),
        }
    }
    info!("stopped announcing");
}

// ── Browsing ──────────────────────────────────────────────────────────────────

/// Binds `bind` and streams every listing announced to it.
///
/// The background task ends when the returned receiver is dropped.
///
/// # Errors
///
/// Returns [`DiscoveryError::BindFailed`] if the socket cannot be bound.
pub async fn browse(bind: SocketAddr) -> Result<mpsc::Receiver<DiscoveredListing>, DiscoveryError> {
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|source| DiscoveryError::BindFailed { addr: bind, source })?;
    info!("browsing for listings on UDP {}", socket.local_addr()?);

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, source) = tokio::select! {
                _ = tx.closed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("discovery recv error: {e}");
                        continue;
                    }
                },
            };
            let Some(announcement) = Announcement::parse(&buf[..len]) else {
                debug!("ignoring malformed announcement from {source}");
                continue;
            };
            let found = DiscoveredListing::from_announcement(announcement, source);
            if tx.send(found).await.is_err() {
                break;
            }
        }
        debug!("browse task stopped");
    });
    Ok(rx)
}

/// Drops listings published under `own_name`.
pub fn is_foreign(found: &DiscoveredListing, own_name: &str) -> bool {
    found.listing.name != own_name
}

// ── Tests ─────────────────────────────────────────────────────────────────────
