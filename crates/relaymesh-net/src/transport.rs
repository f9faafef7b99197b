//! Message channels to directly connected peers
//!
//! A [`MessageChannel`] is a reliable, ordered link to one peer. It carries
//! relay envelopes to a relay and, on a relay, to the destination peer.

use crate::framing::{Frame, FrameError};
use crate::peer::PeerInfo;
use async_trait::async_trait;
use relaymesh_core::{Envelope, PeerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("Link handshake failed: {0}")]
    Handshake(String),
    #[error("No dialer configured")]
    NoDialer,
}

/// Reliable, ordered, connection-oriented link to one directly connected peer
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Peer at the other end of the link
    fn remote(&self) -> &PeerId;

    /// Whether frames can still be sent
    fn is_open(&self) -> bool;

    /// Send a frame, waiting for queue space
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Queue a frame without ever blocking the caller.
    ///
    /// Used for replies generated on the dispatch path. Failures are logged.
    /// A frame that cannot be queued immediately may be overtaken by frames
    /// sent after it; callers only use this for control replies whose order
    /// relative to other traffic does not matter.
    fn send_async(&self, frame: Frame);

    /// Close the link
    fn close(&self);
}

/// Establishes direct links to peers (used for reconnect attempts)
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &PeerInfo) -> Result<Arc<dyn MessageChannel>, TransportError>;
}

/// Send an envelope and wait until it is queued
pub async fn send_envelope(
    channel: &dyn MessageChannel,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    channel.send(Frame::relay(envelope)?).await
}

/// Queue an envelope without blocking
pub fn send_envelope_async(channel: &dyn MessageChannel, envelope: &Envelope) {
    match Frame::relay(envelope) {
        Ok(frame) => channel.send_async(frame),
        Err(e) => warn!("Failed to encode {}: {}", envelope, e),
    }
}

/// Queue-backed channel; a writer task drains the receiver onto the wire
pub struct Connection {
    remote: PeerId,
    tx: mpsc::Sender<Frame>,
    open: AtomicBool,
}

impl Connection {
    /// Create a connection feeding the given queue
    pub fn new(remote: PeerId, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            remote,
            tx,
            open: AtomicBool::new(true),
        }
    }

    /// Create a connection together with the receiving end of its queue
    pub fn with_queue(remote: PeerId, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(remote, tx), rx)
    }
}

#[async_trait]
impl MessageChannel for Connection {
    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn send_async(&self, frame: Frame) {
        if !self.is_open() {
            warn!("Dropping frame to {}: connection closed", self.remote);
            return;
        }
        match self.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                // Hand the frame to a task so the caller never waits on the queue
                let Ok(runtime) = Handle::try_current() else {
                    warn!("Dropping frame to {}: queue full outside a runtime", self.remote);
                    return;
                };
                let tx = self.tx.clone();
                let remote = self.remote.clone();
                runtime.spawn(async move {
                    if tx.send(frame).await.is_err() {
                        warn!("Dropping frame to {}: connection closed", remote);
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Dropping frame to {}: connection closed", self.remote);
            }
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_core::ConnectionId;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_send_envelope() {
        let (conn, mut rx) = Connection::with_queue(peer("relay"), 4);
        let envelope = Envelope::syn(peer("a"), peer("b"), ConnectionId(1));

        send_envelope(&conn, &envelope).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.envelope().unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_send() {
        let (conn, _rx) = Connection::with_queue(peer("relay"), 4);
        assert!(conn.is_open());

        conn.close();
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(Frame::ping()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_connection() {
        let (conn, rx) = Connection::with_queue(peer("relay"), 4);
        drop(rx);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_send_async_overflows_to_task() {
        let (conn, mut rx) = Connection::with_queue(peer("relay"), 1);

        conn.send_async(Frame::ping());
        conn.send_async(Frame::pong());

        assert_eq!(rx.recv().await.unwrap(), Frame::ping());
        assert_eq!(rx.recv().await.unwrap(), Frame::pong());
    }

    #[test]
    fn test_send_async_full_queue_outside_runtime() {
        let (conn, mut rx) = Connection::with_queue(peer("relay"), 1);

        conn.send_async(Frame::ping());
        // No runtime to hand the overflow to: dropped, not a panic
        conn.send_async(Frame::pong());

        assert_eq!(rx.try_recv().unwrap(), Frame::ping());
        assert!(rx.try_recv().is_err());
    }
}
