//! # peerlink-node
//!
//! Headless Peerlink node. Opens the local database, registers a profile
//! from the environment if none exists, listens for peers, dials the
//! bootstrap list and logs every UI event until Ctrl+C.

mod config;

use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerlink_net::{Node, NodeConfig, NodeEvent};
use peerlink_store::Database;

use crate::config::HostConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,peerlink_net=debug,peerlink_store=info")
        }))
        .init();

    info!("Starting {} node v{}", peerlink_shared::constants::APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and open the database
    // -----------------------------------------------------------------------
    let host = HostConfig::from_env();
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    let db = match &host.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), "Database opened");

    // -----------------------------------------------------------------------
    // 3. Start the node
    // -----------------------------------------------------------------------
    let node = Node::start(config, db).await?;

    match (node.profile(), &host.profile) {
        (Some(profile), _) => info!(user = %profile.user_id, name = %profile.name, "Profile loaded"),
        (None, Some(input)) => {
            let profile = node.register(input)?;
            info!(user = %profile.user_id, "Profile registered from environment");
        }
        (None, None) => warn!("No profile registered; set PEERLINK_NAME, PEERLINK_EMAIL and PEERLINK_IP"),
    }

    tokio::spawn(log_events(node.subscribe()));

    for addr in &host.bootstrap {
        if let Err(e) = node.connect(addr).await {
            warn!(addr = %addr, error = %e, "Bootstrap dial failed");
        }
    }

    // -----------------------------------------------------------------------
    // 4. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    node.shutdown();

    Ok(())
}

/// Stand-in for the UI: print what the desktop shell would receive.
async fn log_events(mut rx: broadcast::Receiver<NodeEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match event.payload_json() {
                Ok(payload) => info!(event = event.name(), %payload, "UI event"),
                Err(e) => warn!(event = event.name(), error = %e, "Unserializable UI event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "UI event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
