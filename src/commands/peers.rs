use clap::{Args, Subcommand};

use super::{CommandError, NodeApi, OutputFormat};
use peersync::registry::PeerRecord;
use peersync::sync::protocol::{AddPeerRequest, PeerResponse, StatusResponse};

/// Manage the node's peers
#[derive(Debug, Args)]
pub struct PeersCommand {
    #[command(subcommand)]
    command: PeersSubcommand,
}

#[derive(Debug, Subcommand)]
enum PeersSubcommand {
    /// List known peers
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Add a peer manually, bypassing discovery
    Add {
        /// Peer node id
        peer_id: String,
        /// Peer host or IP
        host: String,
        /// Peer API port
        #[arg(default_value_t = 8000)]
        port: u16,
    },
    /// Remove a peer
    Remove {
        /// Peer node id
        peer_id: String,
    },
}

impl PeersCommand {
    pub async fn run(&self, api: &NodeApi) -> Result<(), CommandError> {
        match &self.command {
            PeersSubcommand::List { format } => {
                let status: StatusResponse = api.get("/p2p/status").await?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&status.peers)?)
                    }
                    OutputFormat::Text => print_peers(&status.peers),
                }
            }
            PeersSubcommand::Add {
                peer_id,
                host,
                port,
            } => {
                let request = AddPeerRequest {
                    peer_id: peer_id.clone(),
                    host: host.clone(),
                    port: *port,
                    protocol_version: None,
                };
                let response: PeerResponse = api.post("/p2p/peers", Some(&request)).await?;
                println!("{} ({})", response.message, response.peer.base_url());
            }
            PeersSubcommand::Remove { peer_id } => {
                let path = format!("/p2p/peers/{}", urlencoding::encode(peer_id));
                let response: PeerResponse = api.delete(&path).await?;
                println!("{}", response.message);
            }
        }
        Ok(())
    }
}

fn print_peers(peers: &[PeerRecord]) {
    if peers.is_empty() {
        println!("No known peers.");
        return;
    }

    println!("{:<38} {:<8} {:<28} LAST SEEN", "PEER", "STATUS", "URL");
    for peer in peers {
        println!(
            "{:<38} {:<8} {:<28} {}",
            peer.peer_id,
            peer.status,
            peer.base_url(),
            peer.last_seen.format("%Y-%m-%d %H:%M:%S")
        );
    }
}
