//! Networking primitives and relayed connections for relaymesh
//!
//! This crate provides:
//! - Message framing over peer links
//! - The message channel and peer registry abstractions
//! - Relay selection and background relay seeking
//! - Relayed connection handlers and the relay switchboard

pub mod counter;
pub mod error;
pub mod events;
pub mod framing;
pub mod handler;
pub mod peer;
pub mod pending;
pub mod registry;
pub mod seeker;
pub mod selector;
pub mod switchboard;
pub mod transport;

pub use counter::{TransferCounter, TransferStats};
pub use error::RelayError;
pub use events::{ListenerEvent, RelayEvent};
pub use framing::{Frame, FrameCodec, FrameType};
pub use handler::{HandlerState, RelayedChannel, RelayedConnectionHandler};
pub use peer::PeerInfo;
pub use pending::PendingTable;
pub use registry::{MemoryRegistry, PeerConnection, PeerHandle, PeerRegistry, RegistryError};
pub use seeker::RelaySeeker;
pub use selector::{is_relay, RelaySelector};
pub use switchboard::{Switchboard, SwitchboardConfig};
pub use transport::{Connection, Dialer, MessageChannel, TransportError};
