//! Relay switchboard
//!
//! Control plane for relayed connections. Every relay envelope received on a
//! peer link goes through [`Switchboard::handle_envelope`], which either
//!
//! 1. processes it, if it is addressed to us, by letting the matching
//!    [`RelayedConnectionHandler`] act on it, or
//! 2. forwards it to the destination peer, if that peer is connected to us.
//!
//! The switchboard also originates outbound relayed connections and runs the
//! background relay seeker.

use crate::counter::TransferCounter;
use crate::error::RelayError;
use crate::events::{ListenerEvent, RelayEvent};
use crate::framing::{Frame, FrameType};
use crate::handler::{HandlerContext, RelayedChannel, RelayedConnectionHandler};
use crate::pending::{PendingTable, DEFAULT_WARN_THRESHOLD};
use crate::registry::{PeerConnection, PeerHandle, PeerRegistry, RegistryError};
use crate::seeker::RelaySeeker;
use crate::selector::RelaySelector;
use crate::transport::{send_envelope, send_envelope_async, MessageChannel};
use parking_lot::Mutex;
use relaymesh_core::{ConnectionId, Envelope, EnvelopeType, PeerId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// Switchboard settings
#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    /// How long `open` waits for ACK or NACK
    pub handshake_timeout: Duration,
    /// Sleep between handshake polls
    pub poll_interval: Duration,
    /// Period of the relay seeking task
    pub seek_interval: Duration,
    /// Period of the relayed traffic stats log
    pub stats_interval: Duration,
    /// Pending table size logged as a handshake leak
    pub pending_warn_threshold: usize,
    /// Hard limit on concurrent handshakes (`None` = unlimited)
    pub max_pending: Option<usize>,
    /// Allow opening and accepting relayed connections
    pub relayed_connections: bool,
    /// Seek a relay automatically when none is connected
    pub auto_connect: bool,
    /// LAN-only mode never seeks relays
    pub lan_only: bool,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(50),
            seek_interval: Duration::from_secs(20),
            stats_interval: Duration::from_secs(10),
            pending_warn_threshold: DEFAULT_WARN_THRESHOLD,
            max_pending: None,
            relayed_connections: true,
            auto_connect: true,
            lan_only: false,
        }
    }
}

/// Process-wide relay service. Cheap to clone.
#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<Inner>,
}

struct Inner {
    local: PeerId,
    registry: Arc<dyn PeerRegistry>,
    selector: Arc<RelaySelector>,
    seeker: Arc<RelaySeeker>,
    pending: Arc<PendingTable>,
    counter: TransferCounter,
    next_connection_id: AtomicU64,
    acting_as_relay: AtomicBool,
    config: SwitchboardConfig,
    events: broadcast::Sender<RelayEvent>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Switchboard {
    pub fn new(registry: Arc<dyn PeerRegistry>, config: SwitchboardConfig) -> Self {
        let local = registry.local_peer().clone();
        let selector = Arc::new(RelaySelector::new(registry.clone()));
        let seeker = Arc::new(RelaySeeker::new(
            registry.clone(),
            selector.clone(),
            config.auto_connect,
            config.lan_only,
        ));
        let pending = Arc::new(PendingTable::new(
            config.pending_warn_threshold,
            config.max_pending,
        ));
        let (events, _) = broadcast::channel(256);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Inner {
                local,
                registry,
                selector,
                seeker,
                pending,
                counter: TransferCounter::new(),
                next_connection_id: AtomicU64::new(0),
                acting_as_relay: AtomicBool::new(false),
                config,
                events,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start background tasks
    pub fn start(&self) {
        let handle = self
            .inner
            .seeker
            .clone()
            .spawn(self.inner.config.seek_interval, self.inner.shutdown_tx.subscribe());
        self.inner.tasks.lock().push(handle);
    }

    /// Stop background tasks and fail every pending handshake
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let failed = self.inner.pending.shutdown_all();
        if failed > 0 {
            info!("Shut down {} pending relayed connections", failed);
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn config(&self) -> &SwitchboardConfig {
        &self.inner.config
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.inner.pending
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn transfer_counter(&self) -> &TransferCounter {
        &self.inner.counter
    }

    pub fn selector(&self) -> &Arc<RelaySelector> {
        &self.inner.selector
    }

    pub fn seeker(&self) -> &Arc<RelaySeeker> {
        &self.inner.seeker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Relay that outbound connections would go through right now
    pub fn current_relay(&self) -> Option<Arc<dyn PeerHandle>> {
        self.inner.selector.current_relay()
    }

    /// Whether this node has relayed traffic for other peers
    pub fn is_acting_as_relay(&self) -> bool {
        self.inner.acting_as_relay.load(Ordering::Acquire)
    }

    fn context(&self) -> HandlerContext {
        HandlerContext {
            local: self.inner.local.clone(),
            pending: self.inner.pending.clone(),
            events: self.inner.events.clone(),
        }
    }

    fn allocate_connection_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    // =========================================================================
    // LISTENER EVENTS
    // =========================================================================

    /// React to reachability changes seen by the direct listener
    pub fn handle_listener_event(&self, event: ListenerEvent) {
        match event {
            ListenerEvent::PubliclyReachable => {
                if !self.inner.selector.set_pseudo_relay(true) {
                    info!("Publicly reachable, acting as supernode");
                }
            }
            ListenerEvent::ReachabilityReset => {
                if self.inner.selector.set_pseudo_relay(false) {
                    info!("Resetting supernode state");
                }
            }
        }
    }

    /// Follow a stream of listener events until it closes or we shut down
    pub fn subscribe_listener(&self, mut events: broadcast::Receiver<ListenerEvent>) {
        let switchboard = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => switchboard.handle_listener_event(event),
                        Err(RecvError::Lagged(n)) => warn!("Missed {} listener events", n),
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Open a relayed connection to `destination` through the current relay.
    ///
    /// Waits up to the handshake timeout for the destination's answer.
    pub async fn open_relayed_connection(
        &self,
        destination: &PeerId,
    ) -> Result<RelayedChannel, RelayError> {
        if destination == &self.inner.local {
            return Err(RelayError::Loopback(destination.clone()));
        }
        if !self.inner.config.relayed_connections {
            return Err(RelayError::Disabled);
        }
        if self.bound_relayed(destination).is_some() {
            return Err(RegistryError::AlreadyConnected(destination.clone()).into());
        }
        let relay = self
            .current_relay()
            .and_then(|relay| relay.channel())
            .ok_or_else(|| RelayError::NoRelay(destination.clone()))?;
        debug!("Using relay {}", relay.remote());

        let connection_id = self.allocate_connection_id();
        let handler = RelayedConnectionHandler::new(
            &self.context(),
            destination.clone(),
            connection_id,
            relay.clone(),
            true,
        );
        // Registered before the SYN leaves so an immediate ACK finds it
        if let Err(e) = self.inner.pending.insert(handler.clone()) {
            handler.shutdown();
            return Err(e);
        }

        info!("Sending SYN for relayed connection to {} via {}", destination, relay.remote());
        let syn = Envelope::syn(self.inner.local.clone(), destination.clone(), connection_id);
        if let Err(e) = send_envelope(relay.as_ref(), &syn).await {
            handler.shutdown();
            return Err(RelayError::ConnectionBroken(format!(
                "relay {} unreachable: {}",
                relay.remote(),
                e
            )));
        }

        if let Err(e) = handler
            .wait_for_ack_or_nack(self.inner.config.handshake_timeout, self.inner.poll_interval())
            .await
        {
            warn!("Relayed connection to {} failed: {}", destination, e);
            handler.shutdown_with_peer();
            return Err(e);
        }

        // The dispatch path completed and bound the handler before flagging the ACK
        if !handler.is_connected() {
            return Err(RelayError::ConnectionBroken(format!(
                "{} closed during handshake",
                handler
            )));
        }
        info!("Relayed connection {} to {} established", connection_id, destination);
        Ok(RelayedChannel::new(handler))
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Drive dispatch for one inbound link: frames are handled in arrival order.
    pub fn spawn_dispatch(
        &self,
        link: Arc<dyn MessageChannel>,
        mut frames: mpsc::Receiver<Frame>,
    ) -> JoinHandle<()> {
        let switchboard = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                switchboard.handle_frame(&link, frame).await;
            }
            debug!("Dispatch for {} ended", link.remote());
            switchboard.link_closed(&link);
        })
    }

    /// Tear down relayed connections tunnelled through a link that went down
    pub fn link_closed(&self, link: &Arc<dyn MessageChannel>) -> usize {
        let mut handlers = self.inner.pending.snapshot();
        handlers.extend(
            self.inner
                .registry
                .connected_peers()
                .into_iter()
                .filter_map(|peer| match peer.current_handler() {
                    Some(PeerConnection::Relayed(handler)) => Some(handler),
                    _ => None,
                }),
        );

        let mut closed = 0;
        for handler in handlers.iter().filter(|h| Arc::ptr_eq(h.relay(), link)) {
            handler.shutdown();
            closed += 1;
        }
        if closed > 0 {
            info!("Link to {} lost, closed {} relayed connections", link.remote(), closed);
        }
        closed
    }

    /// Handle one frame received on `from`
    pub async fn handle_frame(&self, from: &Arc<dyn MessageChannel>, frame: Frame) {
        match frame.frame_type {
            FrameType::Relay => match frame.envelope() {
                Ok(envelope) => self.handle_envelope(from, envelope).await,
                Err(e) => warn!("Dropping malformed relay frame from {}: {}", from.remote(), e),
            },
            FrameType::Ping => from.send_async(Frame::pong()),
            FrameType::Pong => {}
            FrameType::Hello => warn!("Unexpected hello from {}", from.remote()),
        }
    }

    /// Handle a relay envelope received from the directly connected peer
    /// behind `received_from`.
    pub async fn handle_envelope(&self, received_from: &Arc<dyn MessageChannel>, envelope: Envelope) {
        if envelope.destination() == &self.inner.local {
            if let Err(e) = self.process_for_local(received_from, envelope) {
                warn!("Relayed message from {}: {}", received_from.remote(), e);
            }
        } else {
            self.relay_envelope(received_from, envelope).await;
        }
    }

    /// Established relayed connection currently bound to `peer`
    fn bound_relayed(&self, peer: &PeerId) -> Option<Arc<RelayedConnectionHandler>> {
        self.inner
            .registry
            .resolve_peer(peer, false)
            .and_then(|handle| handle.current_handler())
            .and_then(|connection| match connection {
                PeerConnection::Relayed(handler) => Some(handler),
                PeerConnection::Direct(_) => None,
            })
    }

    /// Find the handler for (`source`, `connection_id`): the connection bound
    /// to the peer first, then the pending table.
    fn resolve_handler(
        &self,
        source: &PeerId,
        connection_id: ConnectionId,
    ) -> Option<Arc<RelayedConnectionHandler>> {
        self.bound_relayed(source)
            .filter(|handler| handler.matches(source, connection_id))
            .or_else(|| self.inner.pending.find(source, connection_id))
    }

    fn process_for_local(
        &self,
        received_from: &Arc<dyn MessageChannel>,
        envelope: Envelope,
    ) -> Result<(), RelayError> {
        let source = envelope.source().clone();
        let connection_id = envelope.connection_id();
        let unknown = || RelayError::UnknownPeer {
            peer: source.clone(),
            connection_id,
        };

        match envelope.envelope_type() {
            EnvelopeType::Syn => {
                info!("SYN received from {}", source);
                self.accept_syn(received_from, &envelope)
            }
            EnvelopeType::Ack => {
                info!("ACK received from {}", source);
                match self.resolve_handler(&source, connection_id) {
                    Some(handler) => self.complete_outbound(handler),
                    None => {
                        // The handshake already gave up; let the destination tear down
                        send_envelope_async(received_from.as_ref(), &envelope.reply(EnvelopeType::Eof));
                        Err(unknown())
                    }
                }
            }
            EnvelopeType::Nack => {
                info!("NACK received from {}", source);
                let handler = self.resolve_handler(&source, connection_id).ok_or_else(unknown)?;
                handler.set_nack_received();
                handler.shutdown();
                Ok(())
            }
            EnvelopeType::Eof => {
                info!("EOF received from {}", source);
                let handler = self.resolve_handler(&source, connection_id).ok_or_else(unknown)?;
                handler.set_eof_received();
                handler.shutdown_with_peer();
                Ok(())
            }
            EnvelopeType::Data => {
                debug!("DATA received: {}", envelope);
                match self.resolve_handler(&source, connection_id) {
                    Some(handler) => {
                        handler.receive_data(envelope);
                        Ok(())
                    }
                    None => {
                        warn!("Got unknown peer while processing relayed message, sending EOF to {}", source);
                        send_envelope_async(received_from.as_ref(), &envelope.reply(EnvelopeType::Eof));
                        Err(unknown())
                    }
                }
            }
        }
    }

    /// Initiator side of an ACK. The handler is connected and bound before
    /// the next envelope on this link is dispatched, so DATA sent right after
    /// the ACK finds it.
    fn complete_outbound(&self, handler: Arc<RelayedConnectionHandler>) -> Result<(), RelayError> {
        if handler.is_initiator() && handler.mark_connected() {
            let channel = RelayedChannel::new(handler.clone());
            if let Err(e) = self.inner.registry.accept_connection(channel) {
                warn!("Unable to bind {}: {}", handler, e);
                handler.shutdown_with_peer();
                return Err(e.into());
            }
        }
        handler.set_ack_received();
        Ok(())
    }

    fn accept_syn(
        &self,
        received_from: &Arc<dyn MessageChannel>,
        syn: &Envelope,
    ) -> Result<(), RelayError> {
        if !self.inner.config.relayed_connections {
            send_envelope_async(received_from.as_ref(), &syn.reply(EnvelopeType::Nack));
            return Err(RelayError::Disabled);
        }
        if self.resolve_handler(syn.source(), syn.connection_id()).is_some() {
            debug!("Ignoring duplicate {}", syn);
            return Ok(());
        }

        let handler = RelayedConnectionHandler::new(
            &self.context(),
            syn.source().clone(),
            syn.connection_id(),
            received_from.clone(),
            false,
        );
        if let Err(e) = self.inner.pending.insert(handler.clone()) {
            handler.shutdown();
            send_envelope_async(received_from.as_ref(), &syn.reply(EnvelopeType::Nack));
            return Err(e);
        }

        // Accept work never runs on the dispatch path
        let switchboard = self.clone();
        tokio::spawn(async move {
            switchboard.accept_incoming(handler).await;
        });
        Ok(())
    }

    /// Destination side of the handshake: bind the connection locally, then
    /// answer with exactly one of ACK or NACK.
    async fn accept_incoming(&self, handler: Arc<RelayedConnectionHandler>) {
        let local = self.inner.local.clone();
        let remote = handler.remote().clone();
        let connection_id = handler.connection_id();
        let relay = handler.relay().clone();
        let nack = Envelope::nack(local.clone(), remote.clone(), connection_id);

        if !handler.mark_connected() {
            warn!("{} shut down before it was accepted", handler);
            send_envelope_async(relay.as_ref(), &nack);
            return;
        }

        // The initiator only sends a new SYN once its previous connection is
        // gone, so a differently numbered connection still bound here lost its
        // far side without an EOF reaching us.
        if let Some(stale) = self
            .bound_relayed(&remote)
            .filter(|bound| bound.connection_id() != connection_id)
        {
            info!("Replacing stale {} with connection {}", stale, connection_id);
            stale.shutdown();
        }

        let channel = RelayedChannel::new(handler.clone());
        if let Err(e) = self.inner.registry.accept_connection(channel) {
            warn!("Unable to accept connection {}: {}", handler, e);
            handler.shutdown();
            send_envelope_async(relay.as_ref(), &nack);
            return;
        }

        info!("Sending ACK to {}", remote);
        let ack = Envelope::ack(local, remote, connection_id);
        if let Err(e) = send_envelope(relay.as_ref(), &ack).await {
            warn!("Unable to send ACK for {}: {}", handler, e);
            handler.shutdown();
        }
    }

    // =========================================================================
    // RELAYING
    // =========================================================================

    /// Forward an envelope between two other peers
    async fn relay_envelope(&self, received_from: &Arc<dyn MessageChannel>, envelope: Envelope) {
        let destination = self
            .inner
            .registry
            .resolve_peer(envelope.destination(), false)
            .filter(|peer| peer.is_fully_connected())
            .and_then(|peer| peer.channel());

        let Some(destination) = destination else {
            let reply = if envelope.envelope_type() == EnvelopeType::Syn {
                EnvelopeType::Nack
            } else {
                EnvelopeType::Eof
            };
            warn!(
                "Unable to relay message, {} not connected, sending {}. msg: {}",
                envelope.destination(),
                reply,
                envelope
            );
            send_envelope_async(received_from.as_ref(), &envelope.reply(reply));
            return;
        };

        self.note_acting_as_relay(received_from.remote(), &envelope);
        debug!("Relaying to {}: {}", destination.remote(), envelope);

        let payload_len = envelope.payload().map(<[u8]>::len);
        match send_envelope(destination.as_ref(), &envelope).await {
            Ok(()) => {
                if let Some(len) = payload_len {
                    self.inner.counter.record(len);
                }
            }
            Err(e) => {
                warn!(
                    "Connection broken while relaying message to {}: {}",
                    destination.remote(),
                    e
                );
                send_envelope_async(received_from.as_ref(), &envelope.reply(EnvelopeType::Eof));
            }
        }
    }

    fn note_acting_as_relay(&self, from: &PeerId, envelope: &Envelope) {
        if self.inner.acting_as_relay.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Acting as relay. Received from {}, msg: {}", from, envelope);
        let _ = self.inner.events.send(RelayEvent::ActingAsRelay {
            first_from: from.clone(),
        });

        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let period = self.inner.config.stats_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Relayed connection stats: {}", inner.counter.stats());
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }
}

impl Inner {
    fn poll_interval(&self) -> Duration {
        self.config.poll_interval.max(Duration::from_millis(1))
    }
}
