//! Relay selection
//!
//! Relays are recognised by a marker token in their peer identifier.

use crate::registry::{PeerHandle, PeerRegistry};
use relaymesh_core::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifier tokens that mark a peer as relay (matched case-insensitively)
pub const RELAY_MARKERS: [&str; 2] = ["INFRASTRUCTURE", "RELAY"];

/// Whether `peer` advertises relay capability
pub fn is_relay(peer: &PeerId) -> bool {
    let id = peer.as_str().to_uppercase();
    RELAY_MARKERS.iter().any(|marker| id.contains(marker))
}

/// Picks a connected relay for outbound relayed connections
pub struct RelaySelector {
    registry: Arc<dyn PeerRegistry>,
    /// Set while the direct listener sees us as publicly reachable
    pseudo_relay: AtomicBool,
}

impl RelaySelector {
    pub fn new(registry: Arc<dyn PeerRegistry>) -> Self {
        Self {
            registry,
            pseudo_relay: AtomicBool::new(false),
        }
    }

    /// Whether the local peer acts as a relay itself
    pub fn local_is_relay(&self) -> bool {
        is_relay(self.registry.local_peer()) || self.pseudo_relay.load(Ordering::Acquire)
    }

    /// Mark the local peer as publicly reachable (or not)
    pub fn set_pseudo_relay(&self, enabled: bool) -> bool {
        self.pseudo_relay.swap(enabled, Ordering::AcqRel)
    }

    /// First connected relay in registry order with a usable direct link.
    ///
    /// `None` if we are a relay ourselves.
    pub fn current_relay(&self) -> Option<Arc<dyn PeerHandle>> {
        if self.local_is_relay() {
            return None;
        }
        self.registry
            .connected_peers()
            .into_iter()
            .find(|peer| is_relay(peer.id()) && peer.channel().is_some())
    }
}
