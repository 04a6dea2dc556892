use clap::Args;

use super::{CommandError, NodeApi, OutputFormat};
use peersync::sync::protocol::StatusResponse;

/// Show node status, peers and sync progress
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl StatusCommand {
    pub async fn run(&self, api: &NodeApi) -> Result<(), CommandError> {
        let status: StatusResponse = api.get("/p2p/status").await?;
        let progress: serde_json::Value = api.get("/p2p/sync-status").await?;

        if let OutputFormat::Json = self.format {
            let combined = serde_json::json!({"status": status, "sync": progress});
            println!("{}", serde_json::to_string_pretty(&combined)?);
            return Ok(());
        }

        println!("Node {}", status.node_id);
        println!("==========================================");
        println!();
        println!("API:        {}", api.base_url());
        println!("Protocol:   {}", status.protocol_version);
        println!("Interval:   {}s", status.sync_config.sync_interval);
        println!("Tables:     {}", status.sync_config.sync_tables.join(", "));
        println!(
            "Discovery:  {}",
            if status.sync_config.enable_auto_discovery {
                "enabled"
            } else {
                "disabled"
            }
        );
        println!();

        if status.peers.is_empty() {
            println!("No known peers.");
        } else {
            println!("Peers ({}):", status.peer_count);
            for peer in &status.peers {
                println!(
                    "  {:<38} {:<8} {}:{}  last seen {}",
                    peer.peer_id,
                    peer.status,
                    peer.host,
                    peer.port,
                    peer.last_seen.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        println!();

        print_progress(&progress);
        Ok(())
    }
}

fn print_progress(progress: &serde_json::Value) {
    let running = progress["sync_running"].as_bool().unwrap_or(false);
    println!("Sync running: {}", if running { "yes" } else { "no" });

    match progress.get("last_round").filter(|r| !r.is_null()) {
        Some(round) => {
            println!(
                "Last round:   {} at {} ({} table(s), {} row(s) applied, {} conflict(s), {} error(s))",
                round["trigger"].as_str().unwrap_or("?"),
                round["started_at"].as_str().unwrap_or("?"),
                round["tables_processed"],
                round["rows_applied"],
                round["conflicts_resolved"],
                round["errors"].as_array().map(Vec::len).unwrap_or(0)
            );
        }
        None => println!("Last round:   none yet"),
    }

    if let Some(cursors) = progress["peer_sync_times"].as_object() {
        for (peer, tables) in cursors {
            println!("  {}", peer);
            if let Some(tables) = tables.as_object() {
                for (table, cursor) in tables {
                    println!(
                        "    {:<12} pulled {}  pushed {}",
                        table,
                        cursor["pulled"].as_str().unwrap_or("never"),
                        cursor["pushed"].as_str().unwrap_or("never")
                    );
                }
            }
        }
    }
}

