//! Background relay seeking
//!
//! While no relay is connected, periodically try to reconnect to a known
//! relay so outbound relayed connections become possible again.

use crate::registry::PeerRegistry;
use crate::selector::{is_relay, RelaySelector};
use relaymesh_core::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

pub struct RelaySeeker {
    registry: Arc<dyn PeerRegistry>,
    selector: Arc<RelaySelector>,
    /// Reentrancy guard: a seek attempt is running
    seeking: Arc<AtomicBool>,
    auto_connect: bool,
    lan_only: bool,
}

/// Clears the reentrancy flag when the attempt ends, however it ends
struct SeekGuard(Arc<AtomicBool>);

impl Drop for SeekGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RelaySeeker {
    pub fn new(
        registry: Arc<dyn PeerRegistry>,
        selector: Arc<RelaySelector>,
        auto_connect: bool,
        lan_only: bool,
    ) -> Self {
        Self {
            registry,
            selector,
            seeking: Arc::new(AtomicBool::new(false)),
            auto_connect,
            lan_only,
        }
    }

    pub fn is_seeking(&self) -> bool {
        self.seeking.load(Ordering::Acquire)
    }

    /// Whether a seek attempt should start now
    pub fn should_seek(&self) -> bool {
        self.auto_connect
            && !self.lan_only
            && !self.is_seeking()
            && !self.selector.local_is_relay()
            && self.selector.current_relay().is_none()
    }

    /// One timer tick: start a background attempt if needed
    pub fn tick(self: &Arc<Self>) -> Option<JoinHandle<Option<PeerId>>> {
        if !self.should_seek() {
            return None;
        }
        if self
            .seeking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let guard = SeekGuard(self.seeking.clone());
        let seeker = self.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            seeker.seek_relay().await
        }))
    }

    /// Try known, disconnected relays in registry order; stop at the first
    /// successful reconnect.
    pub async fn seek_relay(&self) -> Option<PeerId> {
        debug!("Trying to connect to a relay");
        for candidate in self.registry.known_peers() {
            if candidate.is_fully_connected() || !is_relay(candidate.id()) {
                continue;
            }
            info!("Trying to connect to relay {}", candidate.id());
            match candidate.attempt_reconnect().await {
                Ok(true) => return Some(candidate.id().clone()),
                Ok(false) => {}
                Err(e) => warn!("Unable to connect to relay {}: {}", candidate.id(), e),
            }
        }
        debug!("No relay reachable");
        None
    }

    /// Run ticks every `period` until shutdown
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick();
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }
}
