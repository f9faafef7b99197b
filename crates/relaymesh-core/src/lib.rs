//! relaymesh Core Library
//!
//! This crate provides the protocol data model for relayed connections:
//! two peers that cannot reach each other directly exchange envelopes
//! through a third peer acting as relay.
//!
//! # Modules
//!
//! - [`types`]: Peer and connection identifiers, relay envelopes
//! - [`canonical`]: Wire encoding of envelopes
//! - [`error`]: Error types

pub mod canonical;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
