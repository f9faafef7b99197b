//! relayd server - peer links and relayed connection service

use crate::config::Config;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relaymesh_core::PeerId;
use relaymesh_net::{
    Connection, Dialer, Frame, FrameCodec, ListenerEvent, MemoryRegistry, MessageChannel, PeerInfo,
    RelayError, RelayEvent, Switchboard, TransportError,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Time allowed for the hello exchange on a new link
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frame queue per link
const LINK_QUEUE: usize = 256;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Server state
pub struct Server {
    config: Config,
    local: PeerId,
    registry: Arc<MemoryRegistry>,
    switchboard: Switchboard,
    listener_events: broadcast::Sender<ListenerEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, local: PeerId) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Server>| {
            let registry = Arc::new(MemoryRegistry::new(local.clone()));
            registry.set_dialer(Arc::new(TcpDialer {
                server: weak.clone(),
            }));
            let switchboard = Switchboard::new(registry.clone(), config.switchboard_config());
            let (listener_events, _) = broadcast::channel(16);
            let (shutdown_tx, _) = broadcast::channel(1);

            Self {
                config,
                local,
                registry,
                switchboard,
                listener_events,
                shutdown_tx,
            }
        })
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    pub fn switchboard(&self) -> &Switchboard {
        &self.switchboard
    }

    /// Signal every task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        self.run_with_listener(listener).await
    }

    /// Run on an already bound listener until shutdown
    pub async fn run_with_listener(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!("Starting relayd as {} on {}", self.local, listener.local_addr()?);

        self.switchboard.start();
        self.switchboard.subscribe_listener(self.listener_events.subscribe());
        let _ = self.listener_events.send(ListenerEvent::ReachabilityReset);
        let events_handle = self.spawn_event_task();

        for addr in self.config.connect.clone() {
            let server = self.clone();
            tokio::spawn(async move {
                info!("Bootstrap peer: {}", addr);
                if let Err(e) = server.connect(addr).await {
                    warn!("Unable to connect to {}: {}", addr, e);
                }
            });
        }
        if let Ok(targets) = self.config.open_targets() {
            for target in targets {
                self.spawn_open_task(target);
            }
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_inbound(stream, addr).await {
                                    warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        self.switchboard.shutdown();
        events_handle.abort();
        Ok(())
    }

    /// Dial `addr` and attach the resulting link
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<dyn MessageChannel>, ServerError> {
        let channel = self.dial(addr, None).await?;
        self.registry
            .add_peer(PeerInfo::new(channel.remote().clone(), vec![addr]));
        self.registry.attach(channel.clone());
        info!("Connected to {} at {}", channel.remote(), addr);
        Ok(channel)
    }

    async fn handle_inbound(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let channel = self.establish(stream, None).await?;
        self.registry.attach(channel.clone());
        info!("Inbound link from {} at {}", channel.remote(), addr);

        if !self.config.lan_only && is_public(addr.ip()) {
            let _ = self.listener_events.send(ListenerEvent::PubliclyReachable);
        }
        Ok(())
    }

    async fn dial(
        self: &Arc<Self>,
        addr: SocketAddr,
        expected: Option<&PeerId>,
    ) -> Result<Arc<dyn MessageChannel>, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        self.establish(stream, expected).await
    }

    /// Exchange hellos, then start the link's writer and reader tasks
    async fn establish(
        self: &Arc<Self>,
        stream: TcpStream,
        expected: Option<&PeerId>,
    ) -> Result<Arc<dyn MessageChannel>, TransportError> {
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed.send(Frame::hello(&self.local)).await?;

        let hello = timeout(HELLO_TIMEOUT, framed.next())
            .await
            .map_err(|_| TransportError::Handshake("no hello received".into()))?
            .ok_or(TransportError::ConnectionClosed)??;
        let remote = hello.hello_peer()?;
        if remote == self.local {
            return Err(TransportError::Handshake("connected to ourselves".into()));
        }
        if let Some(expected) = expected {
            if expected != &remote {
                return Err(TransportError::Handshake(format!(
                    "expected {}, peer answered as {}",
                    expected, remote
                )));
            }
        }

        let (mut sink, mut frames) = framed.split();
        let (conn, mut rx) = Connection::with_queue(remote.clone(), LINK_QUEUE);
        let channel: Arc<dyn MessageChannel> = Arc::new(conn);

        let writer_channel = channel.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!("Write to {} failed: {}", writer_channel.remote(), e);
                    writer_channel.close();
                    break;
                }
            }
        });

        let server = self.clone();
        let reader_channel = channel.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = frames.next() => match next {
                        Some(Ok(frame)) => server.switchboard.handle_frame(&reader_channel, frame).await,
                        Some(Err(e)) => {
                            warn!("Read from {} failed: {}", reader_channel.remote(), e);
                            break;
                        }
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Link to {} closed", reader_channel.remote());
            reader_channel.close();
            writer.abort();
            server.registry.detach(&reader_channel);
            server.switchboard.link_closed(&reader_channel);
        });

        Ok(channel)
    }

    /// Log relay events; drain inbound relayed connections
    fn spawn_event_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        let mut events = self.switchboard.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RelayEvent::Established {
                        remote,
                        connection_id,
                        initiator,
                    }) => {
                        info!("Relayed connection {} with {} established", connection_id, remote);
                        if !initiator {
                            server.spawn_inbound_consumer(remote);
                        }
                    }
                    Ok(RelayEvent::Failed { remote, connection_id }) => {
                        info!("Relayed connection {} with {} failed", connection_id, remote);
                    }
                    Ok(RelayEvent::Closed { remote, connection_id }) => {
                        info!("Relayed connection {} with {} closed", connection_id, remote);
                    }
                    Ok(RelayEvent::ActingAsRelay { first_from }) => {
                        info!("Now relaying traffic, first from {}", first_from);
                    }
                    Err(RecvError::Lagged(n)) => warn!("Missed {} relay events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_inbound_consumer(&self, remote: PeerId) {
        // The handler is bound right after it reports Established
        let registry = self.registry.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let bound = registry.node(&remote).and_then(|node| node.relayed());
                if let Some(handler) = bound {
                    if let Some(mut incoming) = handler.take_incoming() {
                        while let Some(bytes) = incoming.recv().await {
                            info!("{} bytes from {} via {}", bytes.len(), remote, handler.relay_peer());
                        }
                    }
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            debug!("No bound relayed connection for {}", remote);
        });
    }

    /// Keep trying to open a relayed connection to `target`, then greet it
    fn spawn_open_task(self: &Arc<Self>, target: PeerId) {
        let server = self.clone();
        let retry = self.config.switchboard_config().seek_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let channel = loop {
                match server.switchboard.open_relayed_connection(&target).await {
                    Ok(channel) => break channel,
                    Err(e @ (RelayError::Loopback(_) | RelayError::Disabled)) => {
                        error!("Not opening relayed connection to {}: {}", target, e);
                        return;
                    }
                    Err(e) => warn!("Relayed connection to {} failed: {}", target, e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry) => {}
                    _ = shutdown_rx.recv() => return,
                }
            };

            let greeting = format!("hello from {}", server.local);
            if let Err(e) = channel.send(greeting.as_bytes()).await {
                warn!("Unable to greet {}: {}", target, e);
                return;
            }
            if let Some(mut incoming) = channel.take_incoming() {
                while let Some(bytes) = incoming.recv().await {
                    info!("{} bytes from {}", bytes.len(), target);
                }
            }
        });
    }
}

/// Whether an inbound link from `ip` proves we are reachable from the internet
fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

/// Dials known peer addresses for reconnect attempts
struct TcpDialer {
    server: Weak<Server>,
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, peer: &PeerInfo) -> Result<Arc<dyn MessageChannel>, TransportError> {
        let server = self.server.upgrade().ok_or(TransportError::ConnectionClosed)?;
        let mut last_error = TransportError::PeerNotFound(peer.id.clone());
        for addr in &peer.addrs {
            match server.dial(*addr, Some(&peer.id)).await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    debug!("Dial {} at {} failed: {}", peer.id, addr, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
