//! Session transport adapter: glues the frame codec to a byte stream.
//!
//! A [`PeerSession`] owns everything that belongs to one negotiation
//! connection:
//!
//! - the write half of the stream,
//! - the [`NegotiationSession`] state machine, behind a single async mutex,
//! - the cancellation signal for the receive loop.
//!
//! Architecture:
//! - [`PeerSession::start`] spawns one receive-loop task per connection and
//!   returns a channel of [`SessionEvent`]s.
//! - The loop feeds every chunk read from the stream into a [`FrameDecoder`].
//!   Each complete negotiation frame is applied to the session before the next
//!   read starts.
//! - [`PeerSession::send_message`] holds the writer lock for the whole send.
//!   The message is applied to the session before it is written, and the
//!   session lock is released before the write starts, so a write blocked on a
//!   slow peer never stalls the receive loop.  Lock order is writer, then
//!   session.
//!
//! # Cancellation (for beginners)
//!
//! The receive loop waits on two things at once with `tokio::select!`: the next
//! read from the socket and a `watch` channel that flips to `true` on cancel.
//! Whichever finishes first wins, so a cancel stops the loop even if the peer
//! never sends another byte.  [`PeerSession::cancel`] is idempotent: only the
//! first call has an effect.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use trade_core::{
    encode_frame, DecodeStatus, Frame, FrameDecoder, MessageType, NegotiationMessage,
    NegotiationSession, ProtocolViolation, SessionSnapshot, Transition,
};

use crate::application::negotiate::{summary_reply, NegotiationChannel};
use crate::infrastructure::network::transport::TransportError;

/// Size of each socket read.
const READ_CHUNK: usize = 4096;

/// Default cap on a single frame payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Tunables for a [`PeerSession`].
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Frames announcing a larger payload fail the connection.
    pub max_payload_bytes: usize,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            event_buffer: 64,
        }
    }
}

/// Events relayed from a [`PeerSession`] to the application layer.
///
/// `Ready` is always first and `Closed` is always last.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The receive loop is running.
    Ready,
    /// The connection failed; the session has been cancelled.
    Failed(String),
    /// A negotiation message from the peer was applied.
    MessageReceived(NegotiationMessage),
    /// A received message was recorded but broke the negotiation rules.
    Violation(ProtocolViolation),
    /// A frame with an unknown type code was skipped.
    Unrecognized { type_code: u32 },
    /// The receive loop stopped.
    Closed,
}

/// Owner of one negotiation connection.
pub struct PeerSession {
    session: Arc<Mutex<NegotiationSession>>,
    writer: Mutex<Option<BoxedWriter>>,
    cancel_tx: watch::Sender<bool>,
    cancelled: AtomicBool,
    events: mpsc::Sender<SessionEvent>,
    config: AdapterConfig,
}

impl PeerSession {
    /// Starts a session over an already split stream.
    ///
    /// Returns the session handle, the event receiver, and the receive-loop task.
    pub fn start<R, W>(
        session: NegotiationSession,
        reader: R,
        writer: W,
        config: AdapterConfig,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>, JoinHandle<()>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events, rx) = mpsc::channel(config.event_buffer.max(1));
        let (cancel_tx, _) = watch::channel(false);
        let this = Arc::new(Self {
            session: Arc::new(Mutex::new(session)),
            writer: Mutex::new(Some(Box::new(writer))),
            cancel_tx,
            cancelled: AtomicBool::new(false),
            events,
            config,
        });
        let task = tokio::spawn(Arc::clone(&this).receive_loop(reader));
        (this, rx, task)
    }

    /// Starts a session over a connected TCP stream.
    pub fn from_tcp(
        session: NegotiationSession,
        stream: TcpStream,
        config: AdapterConfig,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>, JoinHandle<()>) {
        let (reader, writer) = stream.into_split();
        Self::start(session, reader, writer, config)
    }

    /// Shared handle to the state machine.
    pub fn shared_session(&self) -> Arc<Mutex<NegotiationSession>> {
        Arc::clone(&self.session)
    }

    /// Point-in-time copy of the negotiation state.
    pub async fn current_session_state(&self) -> SessionSnapshot {
        self.session.lock().await.snapshot()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stops the receive loop.  Returns `true` only for the call that cancelled.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel_tx.send_replace(true);
        info!("peer session cancelled");
        true
    }

    /// Cancels and closes the write half so the peer observes end-of-stream.
    pub async fn shutdown(&self) {
        self.cancel();
        self.close_writer().await;
    }

    async fn close_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("error closing write half: {e}");
            }
        }
    }

    /// Encodes, locally applies, and writes `message`.
    ///
    /// Returns `Ok(None)` without sending anything once the session is cancelled.
    ///
    /// # Errors
    ///
    /// Encoding errors are returned as-is.  A write failure also fails the
    /// session (a [`SessionEvent::Failed`] is emitted).
    pub async fn send_message(
        &self,
        message: NegotiationMessage,
    ) -> Result<Option<Transition>, TransportError> {
        if self.is_cancelled() {
            debug!(kind = message.kind.name(), "send after cancel ignored");
            return Ok(None);
        }
        let payload = message.to_payload()?;
        let bytes = encode_frame(MessageType::Negotiation as u32, &payload)?;
        let kind = message.kind.name();
        let id = message.id.clone();

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(None);
        };
        // Applied before the write: the peer's answer cannot be read ahead of it.
        let transition = self.session.lock().await.apply(message);

        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        drop(guard);
        if let Err(e) = written {
            error!("failed to send {kind}: {e}");
            self.fail(format!("write failed: {e}")).await;
            return Err(TransportError::Io(e));
        }
        debug!(%id, kind, "sent negotiation message");

        if transition == Transition::Teardown {
            self.shutdown().await;
        }
        Ok(Some(transition))
    }

    // ── Receive loop ──────────────────────────────────────────────────────────

    async fn receive_loop<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        self.emit(SessionEvent::Ready).await;

        loop {
            if *cancel_rx.borrow_and_update() {
                break;
            }
            let read = tokio::select! {
                biased;
                _ = cancel_rx.changed() => break,
                read = reader.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    if decoder.is_idle() {
                        info!("peer closed the connection");
                        self.cancel();
                    } else {
                        self.fail(TransportError::Truncated.to_string()).await;
                    }
                    break;
                }
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    if let Err(e) = self.drain_frames(&mut decoder).await {
                        self.fail(e.to_string()).await;
                        break;
                    }
                }
                Err(e) => {
                    self.fail(TransportError::Io(e).to_string()).await;
                    break;
                }
            }
        }

        self.emit(SessionEvent::Closed).await;
        debug!("receive loop stopped");
    }

    /// Dispatches every complete frame in `decoder`.
    async fn drain_frames(&self, decoder: &mut FrameDecoder) -> Result<(), TransportError> {
        let limit = self.config.max_payload_bytes;
        loop {
            if self.is_cancelled() {
                return Ok(());
            }
            match decoder.next_frame() {
                DecodeStatus::Frame(frame) => {
                    if frame.payload().len() > limit {
                        return Err(TransportError::PayloadTooLarge {
                            size: frame.payload().len(),
                            limit,
                        });
                    }
                    self.dispatch(frame).await;
                }
                DecodeStatus::NeedMore(_) => {
                    if let Some(header) = decoder.pending_header() {
                        let size = header.payload_length as usize;
                        if size > limit {
                            return Err(TransportError::PayloadTooLarge { size, limit });
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        let payload = match frame {
            Frame::Negotiation(payload) => payload,
            Frame::Unrecognized { type_code, .. } => {
                warn!("skipping frame with unrecognized type {type_code}");
                self.emit(SessionEvent::Unrecognized { type_code }).await;
                return;
            }
        };

        let message = NegotiationMessage::from_payload(&payload);
        let (transition, reply) = {
            let mut session = self.session.lock().await;
            let transition = session.apply(message.clone());
            let reply = summary_reply(&session, &message);
            (transition, reply)
        };

        self.emit(SessionEvent::MessageReceived(message)).await;
        match transition {
            Transition::Violation(violation) => {
                self.emit(SessionEvent::Violation(violation)).await;
            }
            Transition::Teardown => {
                info!("peer resigned; closing connection");
                self.shutdown().await;
            }
            Transition::Advanced | Transition::Recorded => {}
        }

        if let Some(summary) = reply {
            if let Err(e) = self.send_message(summary).await {
                warn!("failed to send summary: {e}");
            }
        }
    }

    /// Cancels once, closes the write half, and relays the failure.
    async fn fail(&self, reason: String) {
        let first = self.cancel();
        self.close_writer().await;
        if first {
            error!("peer session failed: {reason}");
            self.emit(SessionEvent::Failed(reason)).await;
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("session event receiver dropped");
        }
    }
}

#[async_trait]
impl NegotiationChannel for PeerSession {
    async fn session(&self) -> NegotiationSession {
        self.session.lock().await.clone()
    }

    async fn send(&self, message: NegotiationMessage) -> Result<(), String> {
        match self.send_message(message).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err("session is closed".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;
    use trade_core::{Listing, MessageKind, Outcome, Terms, HEADER_SIZE};

    const SELLER: &str = "alice";
    const BUYER: &str = "bob";

    fn listing() -> Listing {
        Listing::new(SELLER, "49000", "1")
    }

    fn frame_bytes(msg: &NegotiationMessage) -> Vec<u8> {
        encode_frame(1, &msg.to_payload().unwrap()).unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        rx.recv().await.expect("event channel closed")
    }

    #[test]
    fn test_adapter_config_default_cap() {
        assert_eq!(AdapterConfig::default().max_payload_bytes, 65536);
    }

    #[tokio::test]
    async fn test_fragmented_input_is_applied_in_order() {
        // Arrange
        let intent = NegotiationMessage::buyer_intent(&listing(), BUYER);
        let bytes = frame_bytes(&intent);
        let (head, tail) = bytes.split_at(5);
        let reader = tokio_test::io::Builder::new()
            .read(head)
            .read(tail)
            .build();
        let session = NegotiationSession::new(listing(), SELLER);

        // Act
        let (peer, mut rx, task) =
            PeerSession::start(session, reader, tokio::io::sink(), AdapterConfig::default());

        // Assert
        assert_eq!(next_event(&mut rx).await, SessionEvent::Ready);
        assert_eq!(next_event(&mut rx).await, SessionEvent::MessageReceived(intent));
        assert_eq!(next_event(&mut rx).await, SessionEvent::Closed);
        task.await.unwrap();
        let state = peer.current_session_state().await;
        assert!(state.turn_ready);
        assert_eq!(state.history.len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_stream_fails_the_session() {
        let bytes = frame_bytes(&NegotiationMessage::buyer_intent(&listing(), BUYER));
        let reader = tokio_test::io::Builder::new()
            .read(&bytes[..bytes.len() - 2])
            .build();

        let (peer, mut rx, _task) = PeerSession::start(
            NegotiationSession::new(listing(), SELLER),
            reader,
            tokio::io::sink(),
            AdapterConfig::default(),
        );

        assert_eq!(next_event(&mut rx).await, SessionEvent::Ready);
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Failed(_)));
        assert_eq!(next_event(&mut rx).await, SessionEvent::Closed);
        assert!(peer.is_cancelled());
    }

    #[tokio::test]
    async fn test_oversized_payload_fails_and_closes_the_connection() {
        // Arrange: only the header of a 100-byte frame ever arrives.
        let (local, mut far) = duplex(256);
        let (reader, writer) = tokio::io::split(local);
        let config = AdapterConfig {
            max_payload_bytes: 10,
            ..Default::default()
        };
        let (peer, mut rx, _task) = PeerSession::start(
            NegotiationSession::new(listing(), SELLER),
            reader,
            writer,
            config,
        );
        let header = encode_frame(1, &vec![b' '; 100]).unwrap();

        // Act
        far.write_all(&header[..HEADER_SIZE]).await.unwrap();

        // Assert
        assert_eq!(next_event(&mut rx).await, SessionEvent::Ready);
        match next_event(&mut rx).await {
            SessionEvent::Failed(reason) => assert!(reason.contains("exceeds")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(next_event(&mut rx).await, SessionEvent::Closed);
        assert!(peer.is_cancelled());
        let mut buf = [0u8; 8];
        let read = timeout(Duration::from_secs(1), far.read(&mut buf))
            .await
            .expect("far side never saw end-of-stream")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_blocked_write_does_not_stall_the_receive_loop() {
        // Arrange: a tiny pipe the far side does not drain yet.
        let (local, mut far) = duplex(8);
        let (reader, writer) = tokio::io::split(local);
        let (peer, mut rx, _task) = PeerSession::start(
            NegotiationSession::new(listing(), BUYER),
            reader,
            writer,
            AdapterConfig::default(),
        );
        assert_eq!(next_event(&mut rx).await, SessionEvent::Ready);
        let intent = NegotiationMessage::buyer_intent(&listing(), BUYER);
        let expected_bytes = frame_bytes(&intent);
        let sender = Arc::clone(&peer);
        let send = tokio::spawn(async move { sender.send_message(intent).await });
        while peer.current_session_state().await.history.is_empty() {
            tokio::task::yield_now().await;
        }

        // Act: the seller answers while the intent is still being written.
        let counter = NegotiationMessage::counter(Terms::new("48000", "1"), SELLER, 1);
        far.write_all(&frame_bytes(&counter)).await.unwrap();

        // Assert
        let received = timeout(Duration::from_secs(2), next_event(&mut rx))
            .await
            .expect("receive loop stalled behind the blocked write");
        assert_eq!(received, SessionEvent::MessageReceived(counter));

        let mut written = vec![0u8; expected_bytes.len()];
        far.read_exact(&mut written).await.unwrap();
        assert_eq!(written, expected_bytes);
        let transition = send.await.unwrap().unwrap();
        assert_eq!(transition, Some(Transition::Advanced));
        assert_eq!(peer.current_session_state().await.cycle, 1);
    }

    #[tokio::test]
    async fn test_unrecognized_frame_is_reported_and_skipped() {
        let intent = NegotiationMessage::buyer_intent(&listing(), BUYER);
        let mut bytes = encode_frame(9, b"??").unwrap();
        bytes.extend(frame_bytes(&intent));
        let reader = tokio_test::io::Builder::new().read(&bytes).build();

        let (_peer, mut rx, _task) = PeerSession::start(
            NegotiationSession::new(listing(), SELLER),
            reader,
            tokio::io::sink(),
            AdapterConfig::default(),
        );

        assert_eq!(next_event(&mut rx).await, SessionEvent::Ready);
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Unrecognized { type_code: 9 }
        );
        assert_eq!(next_event(&mut rx).await, SessionEvent::MessageReceived(intent));
    }

    #[tokio::test]
    async fn test_out_of_turn_message_is_reported_as_violation() {
        let mut bytes = frame_bytes(&NegotiationMessage::buyer_intent(&listing(), BUYER));
        bytes.extend(frame_bytes(&NegotiationMessage::accept(
            Terms::default(),
            BUYER,
            0,
        )));
        let reader = tokio_test::io::Builder::new().read(&bytes).build();

        let (peer, mut rx, task) = PeerSession::start(
            NegotiationSession::new(listing(), SELLER),
            reader,
            tokio::io::sink(),
            AdapterConfig::default(),
        );
        task.await.unwrap();

        let mut violations = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::Violation(ProtocolViolation::NotYourTurn { .. })) {
                violations += 1;
            }
        }
        assert_eq!(violations, 1);
        assert_eq!(peer.current_session_state().await.outcome, None);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_stops_the_loop() {
        // Arrange: a duplex whose far end never writes.
        let (near, _far) = duplex(1024);
        let (reader, writer) = tokio::io::split(near);
        let (peer, mut rx, task) = PeerSession::start(
            NegotiationSession::new(listing(), SELLER),
            reader,
            writer,
            AdapterConfig::default(),
        );
        assert_eq!(next_event(&mut rx).await, SessionEvent::Ready);

        // Act
        let first = peer.cancel();
        let second = peer.cancel();

        // Assert
        assert!(first);
        assert!(!second);
        task.await.unwrap();
        assert_eq!(next_event(&mut rx).await, SessionEvent::Closed);
    }

    #[tokio::test]
    async fn test_send_after_cancel_is_a_no_op() {
        let (near, mut far) = duplex(1024);
        let (reader, writer) = tokio::io::split(near);
        let (peer, _rx, _task) = PeerSession::start(
            NegotiationSession::new(listing(), BUYER),
            reader,
            writer,
            AdapterConfig::default(),
        );
        peer.cancel();

        let result = peer
            .send_message(NegotiationMessage::buyer_intent(&listing(), BUYER))
            .await
            .unwrap();

        assert_eq!(result, None);
        assert!(peer.current_session_state().await.history.is_empty());
        drop(peer);
        let mut buf = Vec::new();
        far.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_sent_message_is_framed_and_applied() {
        let (near, mut far) = duplex(4096);
        let (reader, writer) = tokio::io::split(near);
        let (peer, _rx, _task) = PeerSession::start(
            NegotiationSession::new(listing(), BUYER),
            reader,
            writer,
            AdapterConfig::default(),
        );
        let intent = NegotiationMessage::buyer_intent(&listing(), BUYER);

        let transition = peer.send_message(intent.clone()).await.unwrap();

        assert_eq!(transition, Some(Transition::Advanced));
        let expected = frame_bytes(&intent);
        let mut wire = vec![0u8; expected.len()];
        far.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, expected);
        assert_eq!(peer.current_session_state().await.history, vec![intent]);
    }

    #[tokio::test]
    async fn test_received_accept_triggers_summary() {
        // Arrange: seller side; the buyer sends intent then accepts.
        let (near, mut far) = duplex(4096);
        let (reader, writer) = tokio::io::split(near);
        let (peer, mut rx, _task) = PeerSession::start(
            NegotiationSession::new(listing(), SELLER),
            reader,
            writer,
            AdapterConfig::default(),
        );
        let intent = NegotiationMessage::buyer_intent(&listing(), BUYER);
        far.write_all(&frame_bytes(&intent)).await.unwrap();
        loop {
            if let SessionEvent::MessageReceived(_) = next_event(&mut rx).await {
                break;
            }
        }
        peer.send_message(NegotiationMessage::counter(Terms::new("48000", "1"), SELLER, 1))
            .await
            .unwrap();

        // Act
        far.write_all(&frame_bytes(&NegotiationMessage::accept(
            Terms::new("48000", "1"),
            BUYER,
            1,
        )))
        .await
        .unwrap();

        // Assert: the buyer's end reads the counter and then the summary.
        let mut decoder = FrameDecoder::new();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while received.len() < 2 {
            let n = far.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed early");
            for frame in decoder.feed(&buf[..n]) {
                received.push(NegotiationMessage::from_payload(frame.payload()));
            }
        }
        assert_eq!(received[0].kind, MessageKind::Counter);
        assert_eq!(received[1].kind, MessageKind::Summary);
        assert_eq!(received[1].terms(), Terms::new("48000", "1"));

        let state = peer.current_session_state().await;
        assert_eq!(state.outcome, Some(Outcome::Accepted));
        assert_eq!(state.history.last().map(|m| m.kind), Some(MessageKind::Summary));
    }

    #[tokio::test]
    async fn test_received_resign_tears_down() {
        let (near, mut far) = duplex(4096);
        let (reader, writer) = tokio::io::split(near);
        let (peer, mut rx, task) = PeerSession::start(
            NegotiationSession::new(listing(), SELLER),
            reader,
            writer,
            AdapterConfig::default(),
        );

        far.write_all(&frame_bytes(&NegotiationMessage::resign(
            Terms::default(),
            BUYER,
            0,
        )))
        .await
        .unwrap();
        task.await.unwrap();

        assert!(peer.is_cancelled());
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.last(), Some(&SessionEvent::Closed));
        assert_eq!(
            peer.current_session_state().await.outcome,
            Some(Outcome::Resigned)
        );
        let mut buf = Vec::new();
        far.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty(), "write half must be closed");
    }
}
