//! Peer information

use relaymesh_core::PeerId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Information about a known peer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Network addresses the peer was last reachable on
    pub addrs: Vec<SocketAddr>,
    /// Last seen timestamp (unix millis)
    pub last_seen: u64,
}

impl PeerInfo {
    /// Create new peer info
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self {
            id,
            addrs,
            last_seen: 0,
        }
    }

    /// Remember an address, most recent first
    pub fn add_addr(&mut self, addr: SocketAddr) {
        self.addrs.retain(|a| *a != addr);
        self.addrs.insert(0, addr);
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        use std::time::{SystemTime, UNIX_EPOCH};
        self.last_seen = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_addr_most_recent_first() {
        let mut info = PeerInfo::new(PeerId::new("p").unwrap(), vec![]);
        let a: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:9000".parse().unwrap();

        info.add_addr(a);
        info.add_addr(b);
        info.add_addr(a);
        assert_eq!(info.addrs, vec![a, b]);
    }

    #[test]
    fn test_touch() {
        let mut info = PeerInfo::new(PeerId::new("p").unwrap(), vec![]);
        info.touch();
        assert!(info.last_seen > 0);
    }
}
