//! Relayed connection errors

use crate::handler::HandlerState;
use crate::registry::RegistryError;
use crate::transport::TransportError;
use relaymesh_core::{ConnectionId, PeerId};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by relayed connections.
///
/// Handshake errors (`Loopback`, `NoRelay`, `Nack`, `Timeout`) are the
/// terminal result of an open attempt; there is no retry at this layer.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Illegal relayed loopback connection to ourselves ({0})")]
    Loopback(PeerId),
    #[error("Unable to open relayed connection to {0}: no relay connected")]
    NoRelay(PeerId),
    #[error("NACK received: {0} refused the relayed connection")]
    Nack(PeerId),
    #[error("No ACK from {peer} after {waited:?}")]
    Timeout { peer: PeerId, waited: Duration },
    #[error("Connection broken: {0}")]
    ConnectionBroken(String),
    #[error("Unknown peer {peer} for relayed connection {connection_id}")]
    UnknownPeer {
        peer: PeerId,
        connection_id: ConnectionId,
    },
    #[error("Relayed connections are disabled")]
    Disabled,
    #[error("Too many pending relayed connections ({0})")]
    TooManyPending(usize),
    #[error("Relayed connection not usable in state {0:?}")]
    NotConnected(HandlerState),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Envelope error: {0}")]
    Envelope(#[from] relaymesh_core::Error),
}
