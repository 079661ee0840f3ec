//! TCP transport with a passcode preamble.
//!
//! Before any frame is exchanged, the connecting side writes a preamble:
//!
//! ```text
//! [passcode_len:4 (big-endian)][passcode bytes:N]
//! ```
//!
//! The listener reads the preamble and silently drops connections that present
//! a different passcode.  Connections that pass the check are handed to the
//! caller as plain [`TcpStream`]s, ready for the frame codec.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinSet,
    time,
};
use tracing::{debug, info, warn};
use trade_core::FrameError;

/// Longest passcode accepted in a preamble.
pub const MAX_PASSCODE_LEN: usize = 256;

/// How long an accepted socket may take to present its passcode.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the transport and the session adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connection to the peer failed.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error occurred on an established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The passcode preamble did not match.
    #[error("peer presented a wrong passcode")]
    PasscodeRejected,

    /// The passcode preamble declared an implausible length.
    #[error("passcode preamble of {0} bytes exceeds the limit")]
    PreambleTooLarge(usize),

    /// The peer did not finish its preamble in time.
    #[error("peer did not present a passcode in time")]
    PreambleTimeout,

    /// A received frame announced a payload above the configured cap.
    #[error("frame payload of {size} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// The stream ended with a partial frame buffered.
    #[error("stream ended in the middle of a frame")]
    Truncated,

    /// An outgoing message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// An outgoing frame could not be built.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
}

// ── Preamble ──────────────────────────────────────────────────────────────────

/// Writes the passcode preamble to `writer`.
///
/// # Errors
///
/// Returns [`TransportError::PreambleTooLarge`] for passcodes longer than
/// [`MAX_PASSCODE_LEN`] and [`TransportError::Io`] on write failure.
pub async fn write_passcode<W>(writer: &mut W, passcode: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = passcode.as_bytes();
    if bytes.len() > MAX_PASSCODE_LEN {
        return Err(TransportError::PreambleTooLarge(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a passcode preamble from `reader`.
///
/// # Errors
///
/// Returns [`TransportError::PreambleTooLarge`] when the declared length is
/// above [`MAX_PASSCODE_LEN`] and [`TransportError::Io`] when the stream ends
/// early.
pub async fn read_passcode<R>(reader: &mut R) -> Result<String, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PASSCODE_LEN {
        return Err(TransportError::PreambleTooLarge(len));
    }
    let mut passcode = vec![0u8; len];
    reader.read_exact(&mut passcode).await?;
    Ok(String::from_utf8_lossy(&passcode).into_owned())
}

// ── Connect / listen ──────────────────────────────────────────────────────────

/// Connects to a peer and presents `passcode`.
///
/// # Errors
///
/// Returns [`TransportError::ConnectFailed`] if the TCP connection cannot be
/// established, or the preamble write error.
pub async fn connect(addr: SocketAddr, passcode: &str) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TransportError::ConnectFailed { addr, source })?;
    stream.set_nodelay(true).ok();
    write_passcode(&mut stream, passcode).await?;
    info!("connected to peer at {addr}");
    Ok(stream)
}

/// Outcome of one preamble check.
type Handshake = (SocketAddr, Result<TcpStream, TransportError>);

/// A bound TCP listener that only yields connections presenting the passcode.
///
/// Preambles are checked concurrently, so a connector that stalls before
/// sending its passcode does not hold up the peers behind it.  Checks still in
/// flight when [`accept`](Self::accept) returns are kept for the next call.
pub struct PeerListener {
    listener: TcpListener,
    passcode: String,
    pending: Mutex<JoinSet<Handshake>>,
}

impl PeerListener {
    /// Binds `addr`.  Port `0` picks an ephemeral port; see [`local_addr`](Self::local_addr).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr, passcode: impl Into<String>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        info!("listening for peers on TCP {}", listener.local_addr()?);
        Ok(Self {
            listener,
            passcode: passcode.into(),
            pending: Mutex::new(JoinSet::new()),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the next connection whose preamble carries the right passcode.
    ///
    /// Connections with a wrong, oversized, or missing passcode are dropped and
    /// the wait continues.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the listening socket itself fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let mut pending = self.pending.lock().await;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!("checking preamble from {addr}");
                    let passcode = self.passcode.clone();
                    pending.spawn(async move { (addr, check_preamble(stream, &passcode).await) });
                }
                Some(joined) = pending.join_next(), if !pending.is_empty() => match joined {
                    Ok((addr, Ok(stream))) => {
                        stream.set_nodelay(true).ok();
                        info!("accepted peer {addr}");
                        return Ok((stream, addr));
                    }
                    Ok((addr, Err(e))) => warn!("dropping connection from {addr}: {e}"),
                    Err(e) => warn!("preamble check task failed: {e}"),
                },
            }
        }
    }
}

async fn check_preamble(
    mut stream: TcpStream,
    passcode: &str,
) -> Result<TcpStream, TransportError> {
    let presented = time::timeout(PREAMBLE_TIMEOUT, read_passcode(&mut stream))
        .await
        .map_err(|_| TransportError::PreambleTimeout)??;
    if presented != passcode {
        debug!("passcode mismatch");
        return Err(TransportError::PasscodeRejected);
    }
    Ok(stream)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
