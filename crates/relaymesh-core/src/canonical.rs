//! Canonical encoding for relay envelopes
//!
//! Envelopes use postcard serialization with strict constraints on decode:
//! - Peer identifiers must be non-empty
//! - DATA payloads must respect the chunk limit
//! - No trailing bytes after the envelope

use crate::error::{Error, Result};
use crate::types::{check_payload_len, Envelope};
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Encode an envelope for the wire
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    canonical_bytes(envelope)
}

/// Decode and validate an envelope received from the wire
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let (envelope, rest): (Envelope, &[u8]) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(Error::TrailingBytes(rest.len()));
    }
    validate_envelope(&envelope)?;
    Ok(envelope)
}

/// Check invariants that deserialization alone cannot enforce.
pub fn validate_envelope(envelope: &Envelope) -> Result<()> {
    if envelope.source().as_str().is_empty() || envelope.destination().as_str().is_empty() {
        return Err(Error::EmptyPeerId);
    }
    if let Some(payload) = envelope.payload() {
        check_payload_len(payload.len())?;
    }
    Ok(())
}
