//! Peer registry
//!
//! The relay subsystem resolves peer identifiers through [`PeerRegistry`] and
//! inspects link state through [`PeerHandle`]. [`MemoryRegistry`] is the
//! in-process implementation used by the daemon.

use crate::handler::{RelayedChannel, RelayedConnectionHandler};
use crate::peer::PeerInfo;
use crate::transport::{Dialer, MessageChannel, TransportError};
use async_trait::async_trait;
use parking_lot::RwLock;
use relaymesh_core::PeerId;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Peer already connected: {0}")]
    AlreadyConnected(PeerId),
    #[error("Relayed connection to {0} is not established")]
    NotEstablished(PeerId),
    #[error("Loopback connection to ourselves")]
    Loopback,
}

/// The connection a peer is currently reachable through
#[derive(Clone)]
pub enum PeerConnection {
    Direct(Arc<dyn MessageChannel>),
    Relayed(Arc<RelayedConnectionHandler>),
}

/// Live view of one peer
#[async_trait]
pub trait PeerHandle: Send + Sync {
    fn id(&self) -> &PeerId;

    /// Whether the peer is usable right now (direct link or relayed connection)
    fn is_fully_connected(&self) -> bool;

    /// Open direct message channel, if any
    fn channel(&self) -> Option<Arc<dyn MessageChannel>>;

    /// Connection currently bound to the peer
    fn current_handler(&self) -> Option<PeerConnection>;

    /// Try to establish a direct link. `Ok(true)` if the peer is now connected.
    async fn attempt_reconnect(&self) -> Result<bool, TransportError>;
}

/// Directory of known peers
pub trait PeerRegistry: Send + Sync {
    /// Our own identifier
    fn local_peer(&self) -> &PeerId;

    /// Look up a peer, optionally registering it as known
    fn resolve_peer(&self, id: &PeerId, create_if_absent: bool) -> Option<Arc<dyn PeerHandle>>;

    /// Connected peers, in registry order
    fn connected_peers(&self) -> Vec<Arc<dyn PeerHandle>>;

    /// All known peers (connected or not), in registry order
    fn known_peers(&self) -> Vec<Arc<dyn PeerHandle>>;

    /// Bind a completed relayed connection to its peer
    fn accept_connection(&self, channel: RelayedChannel) -> Result<(), RegistryError>;
}

type DialerSlot = Arc<RwLock<Option<Arc<dyn Dialer>>>>;

/// Registry entry for one peer
pub struct Node {
    id: PeerId,
    info: RwLock<PeerInfo>,
    direct: RwLock<Option<Arc<dyn MessageChannel>>>,
    relayed: RwLock<Option<Arc<RelayedConnectionHandler>>>,
    dialer: DialerSlot,
}

impl Node {
    fn new(info: PeerInfo, dialer: DialerSlot) -> Self {
        Self {
            id: info.id.clone(),
            info: RwLock::new(info),
            direct: RwLock::new(None),
            relayed: RwLock::new(None),
            dialer,
        }
    }

    pub fn info(&self) -> PeerInfo {
        self.info.read().clone()
    }

    /// Bound relayed handler, if it is still established
    pub fn relayed(&self) -> Option<Arc<RelayedConnectionHandler>> {
        self.relayed.read().clone().filter(|h| h.is_connected())
    }

    /// Attach a direct link, replacing any previous one
    pub fn attach(&self, channel: Arc<dyn MessageChannel>) {
        self.info.write().touch();
        if let Some(old) = self.direct.write().replace(channel) {
            old.close();
        }
    }

    /// Detach `channel` if it is still the current direct link
    pub fn detach(&self, channel: &Arc<dyn MessageChannel>) -> bool {
        let mut direct = self.direct.write();
        match direct.as_ref() {
            Some(current) if Arc::ptr_eq(current, channel) => {
                direct.take();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PeerHandle for Node {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn is_fully_connected(&self) -> bool {
        self.channel().is_some() || self.relayed().is_some()
    }

    fn channel(&self) -> Option<Arc<dyn MessageChannel>> {
        self.direct.read().clone().filter(|c| c.is_open())
    }

    fn current_handler(&self) -> Option<PeerConnection> {
        if let Some(handler) = self.relayed() {
            return Some(PeerConnection::Relayed(handler));
        }
        self.channel().map(PeerConnection::Direct)
    }

    async fn attempt_reconnect(&self) -> Result<bool, TransportError> {
        if self.channel().is_some() {
            return Ok(true);
        }
        let dialer = self.dialer.read().clone().ok_or(TransportError::NoDialer)?;
        let info = self.info();
        let channel = dialer.dial(&info).await?;
        let connected = channel.is_open();
        if connected {
            self.attach(channel);
            info!("Reconnected to {}", self.id);
        }
        Ok(connected)
    }
}

/// Insertion-ordered in-memory registry
pub struct MemoryRegistry {
    local: PeerId,
    nodes: RwLock<Vec<Arc<Node>>>,
    dialer: DialerSlot,
}

impl MemoryRegistry {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            nodes: RwLock::new(Vec::new()),
            dialer: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the dialer used for reconnect attempts
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = Some(dialer);
    }

    pub fn node(&self, id: &PeerId) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|n| &n.id == id).cloned()
    }

    fn get_or_insert(&self, info: PeerInfo) -> Arc<Node> {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.iter().find(|n| n.id == info.id) {
            return node.clone();
        }
        let node = Arc::new(Node::new(info, self.dialer.clone()));
        nodes.push(node.clone());
        node
    }

    /// Register a known peer, merging addresses with any existing entry
    pub fn add_peer(&self, info: PeerInfo) -> Arc<Node> {
        let addrs = info.addrs.clone();
        let node = self.get_or_insert(info);
        let mut existing = node.info.write();
        for addr in addrs.into_iter().rev() {
            existing.add_addr(addr);
        }
        drop(existing);
        node
    }

    /// Attach a freshly established direct link
    pub fn attach(&self, channel: Arc<dyn MessageChannel>) -> Arc<Node> {
        let node = self.get_or_insert(PeerInfo::new(channel.remote().clone(), vec![]));
        debug!("Direct link to {} attached", node.id);
        node.attach(channel);
        node
    }

    /// Detach a direct link that went down
    pub fn detach(&self, channel: &Arc<dyn MessageChannel>) {
        if let Some(node) = self.node(channel.remote()) {
            if node.detach(channel) {
                debug!("Direct link to {} detached", node.id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl PeerRegistry for MemoryRegistry {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn resolve_peer(&self, id: &PeerId, create_if_absent: bool) -> Option<Arc<dyn PeerHandle>> {
        let node = if create_if_absent {
            Some(self.get_or_insert(PeerInfo::new(id.clone(), vec![])))
        } else {
            self.node(id)
        };
        node.map(|n| n as Arc<dyn PeerHandle>)
    }

    fn connected_peers(&self) -> Vec<Arc<dyn PeerHandle>> {
        self.nodes
            .read()
            .iter()
            .filter(|n| n.id != self.local && n.is_fully_connected())
            .map(|n| n.clone() as Arc<dyn PeerHandle>)
            .collect()
    }

    fn known_peers(&self) -> Vec<Arc<dyn PeerHandle>> {
        self.nodes
            .read()
            .iter()
            .filter(|n| n.id != self.local)
            .map(|n| n.clone() as Arc<dyn PeerHandle>)
            .collect()
    }

    fn accept_connection(&self, channel: RelayedChannel) -> Result<(), RegistryError> {
        let remote = channel.remote().clone();
        if remote == self.local {
            return Err(RegistryError::Loopback);
        }
        if !channel.is_open() {
            return Err(RegistryError::NotEstablished(remote));
        }
        let node = self.get_or_insert(PeerInfo::new(remote.clone(), vec![]));
        let mut relayed = node.relayed.write();
        if let Some(existing) = relayed.as_ref() {
            if existing.is_connected() && !Arc::ptr_eq(existing, channel.handler()) {
                return Err(RegistryError::AlreadyConnected(remote));
            }
        }
        *relayed = Some(channel.handler().clone());
        info!("Relayed connection {} bound to {}", channel.connection_id(), remote);
        Ok(())
    }
}
