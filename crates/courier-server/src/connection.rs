//! Per-connection state shared between the reader, the writer, and
//! everything that delivers frames to the peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_core::ids::ConnectionId;
use courier_stomp::Frame;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Item queued for the connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Write a frame.
    Frame(Frame),
    /// Flush what is queued ahead, then close the transport.
    Close,
}

/// Lifecycle of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, waiting for CONNECT.
    Handshaking,
    /// CONNECTED sent; frames flow both ways.
    Connected,
    /// A close was requested; queued frames are being flushed.
    Closing,
    /// Transport released.
    Closed,
}

/// A connected peer.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Remote address.
    pub peer: SocketAddr,
    /// When the transport was accepted.
    pub connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
    state: Mutex<ConnectionState>,
    last_received: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    dropped_frames: AtomicU64,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection in [`ConnectionState::Handshaking`].
    pub fn new(peer: SocketAddr, tx: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            peer,
            connected_at: now,
            tx,
            state: Mutex::new(ConnectionState::Handshaking),
            last_received: Mutex::new(now),
            last_sent: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
            cancel,
        }
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `false` and counts a drop if the queue is full or the writer
    /// is gone.
    pub fn send(&self, frame: Frame) -> bool {
        if self.tx.try_send(Outbound::Frame(frame)).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Queue a frame, waiting for room.
    ///
    /// Used for RPC responses, which must not be dropped because the peer is
    /// momentarily slow. Returns `false` once the connection is closed.
    pub async fn deliver(&self, frame: Frame) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(Outbound::Frame(frame)) => sent.is_ok(),
        }
    }

    /// Ask the writer to flush and close. Falls back to an immediate abort
    /// if the close request cannot be queued.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        if self.tx.try_send(Outbound::Close).is_err() {
            self.abort();
        }
    }

    /// Tear the connection down now, discarding queued frames.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled when the connection must stop.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the connection has been torn down.
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `state`.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Record inbound traffic.
    pub fn mark_received(&self) {
        *self.last_received.lock() = Instant::now();
    }

    /// Record outbound traffic.
    pub fn mark_sent(&self) {
        *self.last_sent.lock() = Instant::now();
    }

    /// Time since the peer last sent anything.
    pub fn last_received_elapsed(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    /// Time since anything was written to the peer.
    pub fn last_sent_elapsed(&self) -> Duration {
        self.last_sent.lock().elapsed()
    }

    /// Frames dropped on a full or closed queue.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_connection(capacity: usize) -> (std::sync::Arc<Connection>, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(capacity);
    let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
    (
        std::sync::Arc::new(Connection::new(peer, tx, CancellationToken::new())),
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use courier_stomp::Command;

    #[test]
    fn starts_handshaking() {
        let (conn, _rx) = test_connection(4);
        assert_eq!(conn.state(), ConnectionState::Handshaking);
        assert!(!conn.is_aborted());
        assert!(!conn.id.is_empty());
    }

    #[tokio::test]
    async fn send_queues_frame() {
        let (conn, mut rx) = test_connection(4);
        assert!(conn.send(Frame::new(Command::Receipt)));
        assert_matches!(rx.recv().await, Some(Outbound::Frame(f)) if f.command == Command::Receipt);
    }

    #[test]
    fn full_queue_counts_drop() {
        let (conn, _rx) = test_connection(1);
        assert!(conn.send(Frame::heartbeat()));
        assert!(!conn.send(Frame::heartbeat()));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn closed_queue_counts_drop() {
        let (conn, rx) = test_connection(4);
        drop(rx);
        assert!(!conn.send(Frame::heartbeat()));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn deliver_waits_for_room() {
        let (conn, mut rx) = test_connection(1);
        assert!(conn.send(Frame::heartbeat()));

        let sender = std::sync::Arc::clone(&conn);
        let delivery = tokio::spawn(async move { sender.deliver(Frame::new(Command::Message)).await });

        assert_matches!(rx.recv().await, Some(Outbound::Frame(f)) if f.is_heartbeat());
        assert!(delivery.await.unwrap());
        assert_matches!(rx.recv().await, Some(Outbound::Frame(f)) if f.command == Command::Message);
    }

    #[tokio::test]
    async fn deliver_fails_after_abort() {
        let (conn, _rx) = test_connection(1);
        assert!(conn.send(Frame::heartbeat()));
        conn.abort();
        assert!(!conn.deliver(Frame::heartbeat()).await);
    }

    #[tokio::test]
    async fn close_queues_close_once() {
        let (conn, mut rx) = test_connection(4);
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_matches!(rx.recv().await, Some(Outbound::Close));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_on_full_queue_aborts() {
        let (conn, _rx) = test_connection(1);
        assert!(conn.send(Frame::heartbeat()));
        conn.close();
        assert!(conn.is_aborted());
    }

    #[test]
    fn activity_timestamps() {
        let (conn, _rx) = test_connection(1);
        conn.mark_received();
        conn.mark_sent();
        assert!(conn.last_received_elapsed() < Duration::from_secs(1));
        assert!(conn.last_sent_elapsed() < Duration::from_secs(1));
    }
}
