use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{ChangesCommand, ConfigCommand, NodeApi, PeersCommand, StatusCommand, SyncCommand};
use peersync::NodeConfig;

#[derive(Parser)]
#[command(name = "peersync")]
#[command(version)]
#[command(about = "Operate a peer-to-peer replication node", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Node API URL (default: http://127.0.0.1:<api_port from config>)
    #[arg(long, global = true, env = "PEERSYNC_NODE_URL")]
    node: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node status, peers and sync progress
    Status(StatusCommand),

    /// Manage peers
    Peers(PeersCommand),

    /// Run a sync round now
    Sync(SyncCommand),

    /// Inspect a table's change feed
    Changes(ChangesCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = NodeConfig::load(cli.config)?;
    let api = NodeApi::new(
        &cli.node
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", config.api_port)),
    );

    match cli.command {
        Some(Commands::Status(cmd)) => cmd.run(&api).await?,
        Some(Commands::Peers(cmd)) => cmd.run(&api).await?,
        Some(Commands::Sync(cmd)) => cmd.run(&api).await?,
        Some(Commands::Changes(cmd)) => cmd.run(&api).await?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
