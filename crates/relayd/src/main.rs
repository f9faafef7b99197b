//! relayd - relaymesh peer daemon
//!
//! Maintains direct peer links over TCP and opens, accepts and relays
//! connections tunnelled through relay peers.

use clap::Parser;
use relayd::config::Config;
use relayd::server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relayd=info,relaymesh_net=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config.log_format);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }
    let local = match config.local_peer() {
        Ok(local) => local,
        Err(e) => {
            error!("Invalid peer identifier: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("relayd v{} - relaymesh peer daemon", env!("CARGO_PKG_VERSION"));
    if config.lan_only {
        info!("LAN-only mode, relays will not be sought");
    }
    if !config.relayed_connections {
        info!("Relayed connections disabled");
    }

    let server = Server::new(config, local);

    // Install signal handler
    let signal_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_server.shutdown();
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
