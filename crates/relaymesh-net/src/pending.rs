//! Table of relayed connection handlers still in handshake
//!
//! A handler is in the table exactly while its state is `Init` or
//! `AwaitingAccept`. Handlers remove themselves when they leave those states;
//! the removal and the state change happen under this table's lock.

use crate::error::RelayError;
use crate::handler::RelayedConnectionHandler;
use parking_lot::{Mutex, MutexGuard};
use relaymesh_core::{ConnectionId, PeerId};
use std::sync::Arc;
use tracing::error;

/// Default size above which the table is assumed to leak handshakes
pub const DEFAULT_WARN_THRESHOLD: usize = 20;

pub struct PendingTable {
    entries: Mutex<Vec<Arc<RelayedConnectionHandler>>>,
    warn_threshold: usize,
    max_entries: Option<usize>,
}

impl PendingTable {
    /// Create a table that logs above `warn_threshold` entries and, if
    /// `max_entries` is set, refuses new handshakes at that size.
    pub fn new(warn_threshold: usize, max_entries: Option<usize>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            warn_threshold,
            max_entries,
        }
    }

    /// Add a freshly created handler
    pub fn insert(&self, handler: Arc<RelayedConnectionHandler>) -> Result<usize, RelayError> {
        let mut entries = self.entries.lock();
        if let Some(max) = self.max_entries {
            if entries.len() >= max {
                return Err(RelayError::TooManyPending(entries.len()));
            }
        }
        if !handler.state().is_pending() {
            // Already failed before it could be registered
            return Ok(entries.len());
        }
        entries.push(handler);

        let size = entries.len();
        if size > self.warn_threshold {
            error!(
                "{} PENDING RELAYED CONNECTION HANDLERS found: {:?}",
                size, *entries
            );
        }
        Ok(size)
    }

    /// Find a handler by remote peer and connection ID; both must match.
    pub fn find(
        &self,
        remote: &PeerId,
        connection_id: ConnectionId,
    ) -> Option<Arc<RelayedConnectionHandler>> {
        self.entries
            .lock()
            .iter()
            .find(|h| h.matches(remote, connection_id))
            .cloned()
    }

    pub fn contains(&self, handler: &RelayedConnectionHandler) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|h| std::ptr::eq(Arc::as_ptr(h), handler))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the current entries
    pub fn snapshot(&self) -> Vec<Arc<RelayedConnectionHandler>> {
        self.entries.lock().clone()
    }

    /// Fail every pending handler
    pub fn shutdown_all(&self) -> usize {
        // Handlers take the table lock themselves when leaving it
        let handlers = self.snapshot();
        for handler in &handlers {
            handler.shutdown();
        }
        handlers.len()
    }

    /// Handlers whose table membership disagrees with their state: entries
    /// no longer pending, and handlers from `known` that are pending but
    /// absent. Checked under the table lock, so no transition interleaves.
    pub fn inconsistent(
        &self,
        known: &[Arc<RelayedConnectionHandler>],
    ) -> Vec<Arc<RelayedConnectionHandler>> {
        let entries = self.entries.lock();
        let mut wrong: Vec<_> = entries
            .iter()
            .filter(|h| !h.state().is_pending())
            .cloned()
            .collect();
        wrong.extend(
            known
                .iter()
                .filter(|h| h.state().is_pending() && !entries.iter().any(|e| Arc::ptr_eq(e, h)))
                .cloned(),
        );
        wrong
    }

    /// Lock used by handlers to change state and membership atomically
    pub(crate) fn lock_entries(&self) -> MutexGuard<'_, Vec<Arc<RelayedConnectionHandler>>> {
        self.entries.lock()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_THRESHOLD, None)
    }
}
