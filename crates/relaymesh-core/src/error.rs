//! Error types for relaymesh core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// relaymesh core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// DATA payload exceeds the transport chunk limit
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Peer identifier is empty
    #[error("empty peer identifier")]
    EmptyPeerId,

    /// Trailing bytes after a decoded envelope
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
}
