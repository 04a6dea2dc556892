//! Peersync node
//!
//! Runs one replication node: the `/p2p` HTTP API, peer discovery, health
//! checks and the periodic sync loop.
//!
//! # Configuration
//!
//! Environment variables:
//! - `PEERSYNC_CONFIG`: Path to config file (default: ~/.config/peersync/node.yaml)
//! - `PEERSYNC_*`: Overrides for individual settings (see `NodeConfig`)
//!
//! # Config File Format
//!
//! ```yaml
//! node_id: 6f1c2a4e-...   # generated on first start
//! api_port: 8000
//! discovery_port: 8002
//! sync_interval: 30
//! sync_tables: [users, products, reviews, categories]
//! ```

use peersync::{Node, NodeConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peersync=info,peersync_node=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("PEERSYNC_CONFIG").ok().map(PathBuf::from);
    let config = NodeConfig::load(config_path)?;

    tracing::info!("Node id: {}", config.node_id);
    tracing::info!("Database: {}", config.database_path.display());
    if let Some(path) = &config.config_file {
        tracing::info!("Config file: {}", path.display());
    }

    let port = config.api_port;
    let node = Node::open(config).await?;
    node.start();

    let app = node.router();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    node.shutdown().await;
    Ok(())
}
