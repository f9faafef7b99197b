//! Events published by and consumed by the relay subsystem

use relaymesh_core::{ConnectionId, PeerId};

/// Lifecycle notifications for relayed connections
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    /// Handshake completed, the connection is bound to its peer
    Established {
        remote: PeerId,
        connection_id: ConnectionId,
        initiator: bool,
    },
    /// Handshake did not complete (NACK, timeout, refused or shut down)
    Failed {
        remote: PeerId,
        connection_id: ConnectionId,
    },
    /// An established connection was torn down
    Closed {
        remote: PeerId,
        connection_id: ConnectionId,
    },
    /// This node relayed traffic between two other peers for the first time
    ActingAsRelay { first_from: PeerId },
}

/// Reachability changes observed by the direct listener.
///
/// A node reachable from the internet acts as a pseudo-relay: it stops
/// selecting and seeking relays for itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    /// An inbound connection arrived from a public address
    PubliclyReachable,
    /// Listener restarted or lost its public address
    ReachabilityReset,
}
