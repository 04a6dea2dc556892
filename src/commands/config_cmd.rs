use clap::{Args, Subcommand};

use super::OutputFormat;
use peersync::NodeConfig;

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigSubcommand {
    /// Show the effective local node configuration
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Print the default config file path
    Path,
}

impl ConfigCommand {
    pub fn run(&self, config: &NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                NodeConfig::default_config_path().display()
                            );
                        }
                        println!();

                        println!("node_id:               {}", config.node_id);
                        println!("host:                  {}", config.host);
                        println!("api_port:              {}", config.api_port);
                        println!("discovery_port:        {}", config.discovery_port);
                        println!("sync_interval:         {}s", config.sync_interval);
                        println!("sync_tables:           {}", config.sync_tables.join(", "));
                        println!("max_peers:             {}", config.max_peers);
                        println!("enable_auto_discovery: {}", config.enable_auto_discovery);
                        println!("enable_websocket_sync: {}", config.enable_websocket_sync);
                        println!("health_check_interval: {}s", config.health_check_interval);
                        println!("eviction_grace_period: {}s", config.eviction_grace_period);
                        println!("database_path:         {}", config.database_path.display());
                    }
                }
                Ok(())
            }
            ConfigSubcommand::Path => {
                println!("{}", NodeConfig::default_config_path().display());
                Ok(())
            }
        }
    }
}
