//! Relayed traffic accounting

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Monotonic totals of payload bytes and messages relayed for other peers
#[derive(Debug)]
pub struct TransferCounter {
    bytes: AtomicU64,
    messages: AtomicU64,
    /// Set by the first relayed payload
    started_at: OnceLock<Instant>,
}

/// Point-in-time view of a [`TransferCounter`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferStats {
    pub bytes: u64,
    pub messages: u64,
    pub elapsed: Duration,
}

impl TransferStats {
    /// Average throughput since the first relayed payload
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.bytes as f64 / secs
        }
    }
}

impl fmt::Display for TransferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} msgs, {} bytes ({:.1} KB/s)",
            self.messages,
            self.bytes,
            self.bytes_per_second() / 1024.0
        )
    }
}

impl TransferCounter {
    pub fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            started_at: OnceLock::new(),
        }
    }

    /// Record one relayed payload
    pub fn record(&self, payload_len: usize) {
        self.started_at.get_or_init(Instant::now);
        self.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            bytes: self.bytes(),
            messages: self.messages(),
            elapsed: self
                .started_at
                .get()
                .map(Instant::elapsed)
                .unwrap_or(Duration::ZERO),
        }
    }
}

impl Default for TransferCounter {
    fn default() -> Self {
        Self::new()
    }
}
