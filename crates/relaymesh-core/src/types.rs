//! Core protocol types for relayed connections
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum DATA payload carried by a single envelope (transport chunk limit).
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Opaque peer identifier, as advertised by the peer itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier, rejecting the empty string
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::EmptyPeerId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handshake correlation number, allocated by the initiator.
///
/// Only unique per (initiator, destination) pair, so lookups always match
/// the remote peer as well.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// RELAY ENVELOPE
// =============================================================================

/// Envelope type tag, used for logging and dispatch tables
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    Syn,
    Ack,
    Nack,
    Eof,
    Data,
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeType::Syn => "SYN",
            EnvelopeType::Ack => "ACK",
            EnvelopeType::Nack => "NACK",
            EnvelopeType::Eof => "EOF",
            EnvelopeType::Data => "DATA",
        };
        f.write_str(name)
    }
}

/// Envelope body. Only DATA carries a payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Open request from initiator to destination
    Syn,
    /// Destination accepted the connection
    Ack,
    /// Destination (or relay) refused the connection
    Nack,
    /// Logical connection is over
    Eof,
    /// Application bytes
    Data(Vec<u8>),
}

impl EnvelopeKind {
    pub fn envelope_type(&self) -> EnvelopeType {
        match self {
            EnvelopeKind::Syn => EnvelopeType::Syn,
            EnvelopeKind::Ack => EnvelopeType::Ack,
            EnvelopeKind::Nack => EnvelopeType::Nack,
            EnvelopeKind::Eof => EnvelopeType::Eof,
            EnvelopeKind::Data(_) => EnvelopeType::Data,
        }
    }
}

/// Immutable relay protocol message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    source: PeerId,
    destination: PeerId,
    connection_id: ConnectionId,
    kind: EnvelopeKind,
}

impl Envelope {
    fn control(
        kind: EnvelopeKind,
        source: PeerId,
        destination: PeerId,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            source,
            destination,
            connection_id,
            kind,
        }
    }

    pub fn syn(source: PeerId, destination: PeerId, connection_id: ConnectionId) -> Self {
        Self::control(EnvelopeKind::Syn, source, destination, connection_id)
    }

    pub fn ack(source: PeerId, destination: PeerId, connection_id: ConnectionId) -> Self {
        Self::control(EnvelopeKind::Ack, source, destination, connection_id)
    }

    pub fn nack(source: PeerId, destination: PeerId, connection_id: ConnectionId) -> Self {
        Self::control(EnvelopeKind::Nack, source, destination, connection_id)
    }

    pub fn eof(source: PeerId, destination: PeerId, connection_id: ConnectionId) -> Self {
        Self::control(EnvelopeKind::Eof, source, destination, connection_id)
    }

    /// Create a DATA envelope. Fails if the payload exceeds [`MAX_PAYLOAD_BYTES`].
    pub fn data(
        source: PeerId,
        destination: PeerId,
        connection_id: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<Self> {
        check_payload_len(payload.len())?;
        Ok(Self::control(
            EnvelopeKind::Data(payload),
            source,
            destination,
            connection_id,
        ))
    }

    /// Build a control reply travelling back along the same logical connection.
    ///
    /// Source and destination are swapped, the connection ID is kept.
    pub fn reply(&self, kind: EnvelopeType) -> Self {
        let kind = match kind {
            EnvelopeType::Syn => EnvelopeKind::Syn,
            EnvelopeType::Ack => EnvelopeKind::Ack,
            EnvelopeType::Nack => EnvelopeKind::Nack,
            // A reply never carries data
            EnvelopeType::Eof | EnvelopeType::Data => EnvelopeKind::Eof,
        };
        Self::control(
            kind,
            self.destination.clone(),
            self.source.clone(),
            self.connection_id,
        )
    }

    pub fn source(&self) -> &PeerId {
        &self.source
    }

    pub fn destination(&self) -> &PeerId {
        &self.destination
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn kind(&self) -> &EnvelopeKind {
        &self.kind
    }

    pub fn envelope_type(&self) -> EnvelopeType {
        self.kind.envelope_type()
    }

    /// Payload bytes, present only for DATA
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.kind {
            EnvelopeKind::Data(payload) => Some(payload),
            _ => None,
        }
    }

    /// Consume the envelope, returning the DATA payload if any
    pub fn into_payload(self) -> Option<Vec<u8>> {
        match self.kind {
            EnvelopeKind::Data(payload) => Some(payload),
            _ => None,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {}",
            self.envelope_type(),
            self.connection_id,
            self.source,
            self.destination
        )?;
        if let Some(payload) = self.payload() {
            write!(f, " ({} bytes)", payload.len())?;
        }
        Ok(())
    }
}

pub(crate) fn check_payload_len(size: usize) -> Result<()> {
    if size > MAX_PAYLOAD_BYTES {
        return Err(Error::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[test]
    fn test_empty_peer_id_rejected() {
        assert!(matches!(PeerId::new(""), Err(Error::EmptyPeerId)));
    }

    #[test]
    fn test_payload_only_on_data() {
        let syn = Envelope::syn(peer("a"), peer("b"), ConnectionId(1));
        assert!(syn.payload().is_none());

        let data = Envelope::data(peer("a"), peer("b"), ConnectionId(1), vec![1, 2, 3]).unwrap();
        assert_eq!(data.payload(), Some(&[1u8, 2, 3][..]));
        assert_eq!(data.envelope_type(), EnvelopeType::Data);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(
            Envelope::data(peer("a"), peer("b"), ConnectionId(1), payload),
            Err(Error::PayloadTooLarge { .. })
        ));

        let payload = vec![0u8; MAX_PAYLOAD_BYTES];
        assert!(Envelope::data(peer("a"), peer("b"), ConnectionId(1), payload).is_ok());
    }

    #[test]
    fn test_reply_swaps_addressing() {
        let data = Envelope::data(peer("a"), peer("c"), ConnectionId(7), vec![9]).unwrap();

        let eof = data.reply(EnvelopeType::Eof);
        assert_eq!(eof.source(), &peer("c"));
        assert_eq!(eof.destination(), &peer("a"));
        assert_eq!(eof.connection_id(), ConnectionId(7));
        assert!(eof.payload().is_none());

        // Data replies degrade to EOF
        assert_eq!(data.reply(EnvelopeType::Data).envelope_type(), EnvelopeType::Eof);
    }

    #[test]
    fn test_display() {
        let syn = Envelope::syn(peer("alice"), peer("bob"), ConnectionId(3));
        assert_eq!(syn.to_string(), "SYN #3 alice -> bob");
    }
}
