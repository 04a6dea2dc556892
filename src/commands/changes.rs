use clap::Args;

use super::{CommandError, NodeApi, OutputFormat};
use peersync::sync::protocol::ChangeFeed;

/// Show a node's change feed for a table
#[derive(Debug, Args)]
pub struct ChangesCommand {
    /// Replicated table name
    table: String,

    /// Only rows changed after this ISO-8601 timestamp
    #[arg(long)]
    since: Option<String>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl ChangesCommand {
    pub async fn run(&self, api: &NodeApi) -> Result<(), CommandError> {
        let mut path = format!("/p2p/table-changes/{}", urlencoding::encode(&self.table));
        if let Some(since) = &self.since {
            path.push_str("?since=");
            path.push_str(&urlencoding::encode(since));
        }

        let feed: ChangeFeed = api.get(&path).await?;

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&feed)?),
            OutputFormat::Text => {
                println!(
                    "{} change(s) in {} ({} sync, generated {})",
                    feed.count,
                    feed.table,
                    serde_json::to_value(feed.sync_type)?
                        .as_str()
                        .unwrap_or("?"),
                    feed.timestamp
                );
                for row in &feed.data {
                    println!(
                        "  {:<6} id={:<8} updated_at={}",
                        row.get("change_type").and_then(|v| v.as_str()).unwrap_or("?"),
                        row.get("id").map(|v| v.to_string()).unwrap_or_default(),
                        row.get("updated_at").and_then(|v| v.as_str()).unwrap_or("?")
                    );
                }
            }
        }
        Ok(())
    }
}
