//! Force a sync round on a running node.

use clap::Args;

use super::{CommandError, NodeApi, OutputFormat};

/// Run a bidirectional sync round now
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Only sync with this peer
    #[arg(long)]
    peer: Option<String>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl SyncCommand {
    pub async fn run(&self, api: &NodeApi) -> Result<(), CommandError> {
        let path = match &self.peer {
            Some(peer) => format!("/p2p/sync/bidirectional?peer_id={}", urlencoding::encode(peer)),
            None => "/p2p/sync/bidirectional".to_string(),
        };

        println!("Syncing...");
        let response: serde_json::Value = api.post::<(), _>(&path, None).await?;

        if let OutputFormat::Json = self.format {
            println!("{}", serde_json::to_string_pretty(&response)?);
            return Ok(());
        }

        let round = &response["round"];
        println!("{}", response["message"].as_str().unwrap_or("Sync finished"));
        println!();
        println!("  tables processed:   {}", round["tables_processed"]);
        println!("  rows sent:          {}", round["rows_sent"]);
        println!("  rows applied:       {}", round["rows_applied"]);
        println!("  conflicts resolved: {}", round["conflicts_resolved"]);

        if let Some(errors) = round["errors"].as_array().filter(|e| !e.is_empty()) {
            println!();
            println!("Errors:");
            for error in errors {
                println!("  ✗ {}", error.as_str().unwrap_or("?"));
            }
        }

        Ok(())
    }
}
