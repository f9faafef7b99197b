//! Relayed connection handler
//!
//! One handler represents one end of a logical connection tunnelled through a
//! relay. It tracks the handshake (SYN, then ACK or NACK), frames outgoing
//! bytes into DATA envelopes and hands incoming payloads to the local consumer.
//!
//! ```text
//! Init ───────────┬─► Connected ──► Closed
//! AwaitingAccept ─┘
//!        │
//!        └──────────► Failed
//! ```

use crate::error::RelayError;
use crate::events::RelayEvent;
use crate::pending::PendingTable;
use crate::transport::{send_envelope, send_envelope_async, MessageChannel};
use parking_lot::Mutex;
use relaymesh_core::{ConnectionId, Envelope, PeerId, MAX_PAYLOAD_BYTES};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Lifecycle state of a relayed connection handler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerState {
    /// Initiator side: SYN sent, waiting for ACK or NACK
    Init,
    /// Destination side: SYN received, local accept running
    AwaitingAccept,
    /// Handshake complete, DATA may flow
    Connected,
    /// Handshake did not complete
    Failed,
    /// Connection torn down after being established
    Closed,
}

impl HandlerState {
    /// States in which the handler belongs in the pending table
    pub fn is_pending(self) -> bool {
        matches!(self, HandlerState::Init | HandlerState::AwaitingAccept)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandlerState::Failed | HandlerState::Closed)
    }

    fn can_transition_to(self, next: HandlerState) -> bool {
        use HandlerState::*;
        matches!(
            (self, next),
            (Init, Connected) | (Init, Failed) | (AwaitingAccept, Connected) | (AwaitingAccept, Failed) | (Connected, Closed)
        )
    }
}

/// Shared services a handler reports to
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub local: PeerId,
    pub pending: Arc<PendingTable>,
    pub events: broadcast::Sender<RelayEvent>,
}

pub struct RelayedConnectionHandler {
    local: PeerId,
    remote: PeerId,
    connection_id: ConnectionId,
    /// Link to the relay all envelopes of this connection travel through
    relay: Arc<dyn MessageChannel>,
    initiator: bool,
    state: Mutex<HandlerState>,
    ack_received: AtomicBool,
    nack_received: AtomicBool,
    eof_received: AtomicBool,
    pending: Arc<PendingTable>,
    events: broadcast::Sender<RelayEvent>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl RelayedConnectionHandler {
    pub(crate) fn new(
        ctx: &HandlerContext,
        remote: PeerId,
        connection_id: ConnectionId,
        relay: Arc<dyn MessageChannel>,
        initiator: bool,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = if initiator {
            HandlerState::Init
        } else {
            HandlerState::AwaitingAccept
        };
        Arc::new(Self {
            local: ctx.local.clone(),
            remote,
            connection_id,
            relay,
            initiator,
            state: Mutex::new(state),
            ack_received: AtomicBool::new(false),
            nack_received: AtomicBool::new(false),
            eof_received: AtomicBool::new(false),
            pending: ctx.pending.clone(),
            events: ctx.events.clone(),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Peer relaying this connection
    pub fn relay_peer(&self) -> &PeerId {
        self.relay.remote()
    }

    pub(crate) fn relay(&self) -> &Arc<dyn MessageChannel> {
        &self.relay
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> HandlerState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == HandlerState::Connected
    }

    pub fn is_ack_received(&self) -> bool {
        self.ack_received.load(Ordering::Acquire)
    }

    pub fn is_nack_received(&self) -> bool {
        self.nack_received.load(Ordering::Acquire)
    }

    /// Whether this handler is the end of (`remote`, `connection_id`)
    pub fn matches(&self, remote: &PeerId, connection_id: ConnectionId) -> bool {
        self.connection_id == connection_id && &self.remote == remote
    }

    pub(crate) fn set_ack_received(&self) {
        self.ack_received.store(true, Ordering::Release);
    }

    pub(crate) fn set_nack_received(&self) {
        self.nack_received.store(true, Ordering::Release);
    }

    pub(crate) fn set_eof_received(&self) {
        self.eof_received.store(true, Ordering::Release);
    }

    /// Take the consumer end of the inbound byte stream.
    ///
    /// Payloads received before this call are buffered. The stream ends when
    /// the handler shuts down.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inbound_rx.lock().take()
    }

    /// Complete the handshake
    pub(crate) fn mark_connected(&self) -> bool {
        self.transition(HandlerState::Connected).is_some()
    }

    /// Move to `next`, leaving the pending table if the new state requires it.
    /// Returns the previous state, or `None` if the transition is not allowed.
    fn transition(&self, next: HandlerState) -> Option<HandlerState> {
        let previous = {
            let mut entries = self.pending.lock_entries();
            let mut state = self.state.lock();
            let previous = *state;
            if !previous.can_transition_to(next) {
                return None;
            }
            *state = next;
            if !next.is_pending() {
                entries.retain(|h| !std::ptr::eq(Arc::as_ptr(h), self));
            }
            previous
        };

        if next.is_terminal() {
            // Ends the consumer's stream once buffered payloads are read
            self.inbound_tx.lock().take();
        }

        debug!("{}: {:?} -> {:?}", self, previous, next);
        let event = match next {
            HandlerState::Connected => RelayEvent::Established {
                remote: self.remote.clone(),
                connection_id: self.connection_id,
                initiator: self.initiator,
            },
            HandlerState::Failed => RelayEvent::Failed {
                remote: self.remote.clone(),
                connection_id: self.connection_id,
            },
            HandlerState::Closed => RelayEvent::Closed {
                remote: self.remote.clone(),
                connection_id: self.connection_id,
            },
            HandlerState::Init | HandlerState::AwaitingAccept => return Some(previous),
        };
        // No subscribers is fine
        let _ = self.events.send(event);
        Some(previous)
    }

    /// Tear down local resources only. Used when the remote side already
    /// signalled EOF or NACK.
    pub fn shutdown(&self) {
        self.teardown();
    }

    /// Tear down and, if the connection was established and the remote has
    /// not already closed it, send an EOF courtesy notice through the relay.
    pub fn shutdown_with_peer(&self) {
        if self.teardown() == Some(HandlerState::Connected)
            && !self.eof_received.load(Ordering::Acquire)
        {
            let eof = Envelope::eof(self.local.clone(), self.remote.clone(), self.connection_id);
            send_envelope_async(self.relay.as_ref(), &eof);
        }
    }

    fn teardown(&self) -> Option<HandlerState> {
        match self.state() {
            HandlerState::Init | HandlerState::AwaitingAccept => {
                // May race with a concurrent transition; retry once as Closed
                self.transition(HandlerState::Failed)
                    .or_else(|| self.transition(HandlerState::Closed))
            }
            HandlerState::Connected => self.transition(HandlerState::Closed),
            HandlerState::Failed | HandlerState::Closed => None,
        }
    }

    /// Deliver a DATA envelope to the local consumer.
    ///
    /// Envelopes arriving outside `Connected` are protocol violations and are
    /// dropped.
    pub fn receive_data(&self, envelope: Envelope) {
        let state = self.state();
        if state != HandlerState::Connected {
            warn!("{}: dropping {} received in state {:?}", self, envelope, state);
            return;
        }
        let Some(payload) = envelope.into_payload() else {
            warn!("{}: ignoring envelope without payload", self);
            return;
        };
        let delivered = self
            .inbound_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(payload).is_ok())
            .unwrap_or(false);
        if !delivered {
            debug!("{}: consumer gone, dropping payload", self);
        }
    }

    /// Frame `bytes` into DATA envelopes and send them through the relay.
    ///
    /// A transport failure tears the connection down.
    pub async fn send_data(&self, bytes: &[u8]) -> Result<(), RelayError> {
        let state = self.state();
        if state != HandlerState::Connected {
            return Err(RelayError::NotConnected(state));
        }
        for chunk in bytes.chunks(MAX_PAYLOAD_BYTES) {
            let envelope = Envelope::data(
                self.local.clone(),
                self.remote.clone(),
                self.connection_id,
                chunk.to_vec(),
            )?;
            if let Err(e) = send_envelope(self.relay.as_ref(), &envelope).await {
                warn!("{}: relay link broken while sending: {}", self, e);
                self.shutdown();
                return Err(RelayError::ConnectionBroken(format!(
                    "relay {} unreachable: {}",
                    self.relay_peer(),
                    e
                )));
            }
        }
        Ok(())
    }

    /// Poll until ACK, NACK, shutdown or `timeout`, sleeping `poll_interval`
    /// between checks.
    pub(crate) async fn wait_for_ack_or_nack(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), RelayError> {
        let started = Instant::now();
        let deadline = started + timeout;
        debug!("Waiting for ACK on {}", self);
        loop {
            if self.is_ack_received() {
                debug!("Got ACK on {}", self);
                return Ok(());
            }
            if self.is_nack_received() {
                return Err(RelayError::Nack(self.remote.clone()));
            }
            if self.state().is_terminal() {
                return Err(RelayError::ConnectionBroken(format!(
                    "{} shut down during handshake",
                    self
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RelayError::Timeout {
                    peer: self.remote.clone(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

impl fmt::Display for RelayedConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelayedConnection {} with {} via {}",
            self.connection_id,
            self.remote,
            self.relay.remote()
        )
    }
}

impl fmt::Debug for RelayedConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayedConnectionHandler")
            .field("remote", &self.remote)
            .field("connection_id", &self.connection_id)
            .field("relay", self.relay.remote())
            .field("state", &self.state())
            .finish()
    }
}

/// Connected relayed channel handed to upper layers
#[derive(Clone, Debug)]
pub struct RelayedChannel {
    handler: Arc<RelayedConnectionHandler>,
}

impl RelayedChannel {
    pub(crate) fn new(handler: Arc<RelayedConnectionHandler>) -> Self {
        Self { handler }
    }

    pub fn remote(&self) -> &PeerId {
        self.handler.remote()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handler.connection_id()
    }

    pub fn is_open(&self) -> bool {
        self.handler.is_connected()
    }

    /// Send bytes to the remote peer
    pub async fn send(&self, bytes: &[u8]) -> Result<(), RelayError> {
        self.handler.send_data(bytes).await
    }

    /// Register as the consumer of inbound bytes (first caller wins)
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.handler.take_incoming()
    }

    /// Close the connection, notifying the remote peer
    pub fn close(&self) {
        self.handler.shutdown_with_peer();
    }

    pub fn handler(&self) -> &Arc<RelayedConnectionHandler> {
        &self.handler
    }
}
