//! Configuration for relayd

use clap::Parser;
use relaymesh_core::PeerId;
use relaymesh_net::SwitchboardConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// relayd - relaymesh peer daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "relayd")]
#[command(about = "relaymesh peer daemon with relayed connection support")]
pub struct Config {
    /// Listen address for peer links
    #[arg(short, long, default_value = "0.0.0.0:9300")]
    pub listen: SocketAddr,

    /// Peer identifier (random if unset). Identifiers containing
    /// "relay" or "infrastructure" mark the node as a relay.
    #[arg(long, env = "RELAYD_PEER_ID")]
    pub peer_id: Option<String>,

    /// Peers to connect to at startup (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub connect: Vec<SocketAddr>,

    /// Peers to open relayed connections to once bootstrapped
    #[arg(long, value_delimiter = ',')]
    pub open: Vec<String>,

    /// Only use the local network, never seek relays
    #[arg(long)]
    pub lan_only: bool,

    /// Reconnect to known relays automatically
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    pub auto_connect: bool,

    /// Allow relayed connections
    #[arg(long, env = "RELAYD_RELAYED_CONNECTIONS", default_value = "true", action = clap::ArgAction::Set)]
    pub relayed_connections: bool,

    /// Seconds to wait for a relayed connection handshake
    #[arg(long, default_value = "60")]
    pub handshake_timeout_secs: u64,

    /// Relay seeking interval in seconds
    #[arg(long, default_value = "20")]
    pub seek_interval_secs: u64,

    /// Refuse new relayed handshakes above this many pending
    #[arg(long)]
    pub max_pending: Option<usize>,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(id) = &self.peer_id {
            PeerId::new(id.as_str())?;
        }
        for target in &self.open {
            PeerId::new(target.as_str())?;
        }
        if self.handshake_timeout_secs == 0 {
            anyhow::bail!("Handshake timeout must be at least one second");
        }
        if self.seek_interval_secs == 0 {
            anyhow::bail!("Seek interval must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        Ok(())
    }

    /// Configured peer identifier, or a fresh random one
    pub fn local_peer(&self) -> anyhow::Result<PeerId> {
        let id = match &self.peer_id {
            Some(id) => id.clone(),
            None => format!("node-{}", hex::encode(rand::random::<[u8; 8]>())),
        };
        Ok(PeerId::new(id)?)
    }

    /// Relayed connection targets
    pub fn open_targets(&self) -> anyhow::Result<Vec<PeerId>> {
        self.open
            .iter()
            .map(|id| PeerId::new(id.as_str()).map_err(Into::into))
            .collect()
    }

    pub fn switchboard_config(&self) -> SwitchboardConfig {
        SwitchboardConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            seek_interval: Duration::from_secs(self.seek_interval_secs),
            max_pending: self.max_pending,
            relayed_connections: self.relayed_connections,
            auto_connect: self.auto_connect,
            lan_only: self.lan_only,
            ..Default::default()
        }
    }
}
