//! Node configuration.
//!
//! Values are layered with priority: environment variables > config file >
//! defaults. The node identity is generated on first start and written back
//! to the config file so that it survives restarts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::schema::{self, TableSchema};

/// Intervals shorter than this put the node in low-latency mode: local
/// changes trigger an immediate targeted sync in addition to notifications.
const LOW_LATENCY_THRESHOLD: u64 = 60;

/// Node configuration: the immutable node identity plus tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Globally unique node identity.
    pub node_id: String,
    /// Host advertised to peers.
    pub host: String,
    /// Port of the HTTP API.
    pub api_port: u16,
    /// UDP port for presence announcements.
    pub discovery_port: u16,
    /// Seconds between periodic sync rounds and announcements.
    pub sync_interval: u64,
    /// Tables replicated by this node.
    pub sync_tables: Vec<String>,
    /// Upper bound on known peers.
    pub max_peers: usize,
    pub enable_auto_discovery: bool,
    pub enable_websocket_sync: bool,
    pub protocol_version: String,
    /// Seconds between health probes of known peers.
    pub health_check_interval: u64,
    /// Seconds a peer may stay unreachable before it is evicted.
    pub eviction_grace_period: u64,
    /// Path to the SQLite database.
    pub database_path: PathBuf,
    /// File the configuration was loaded from, if any.
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            host: crate::discovery::local_ip(),
            api_port: 8000,
            discovery_port: 8002,
            sync_interval: 30,
            sync_tables: schema::table_names(),
            max_peers: 10,
            enable_auto_discovery: true,
            enable_websocket_sync: true,
            protocol_version: "1.0.1".to_string(),
            health_check_interval: 60,
            eviction_grace_period: 120,
            database_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("peersync")
                .join("peersync.db"),
            config_file: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration with priority: env vars > config file > defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    /// Same as [`NodeConfig::load`] with an explicit environment lookup.
    pub fn load_with<F>(config_path: Option<PathBuf>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = config_path.unwrap_or_else(Self::default_config_path);

        let mut config = Self::default();
        let mut persisted_id = false;

        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Read(path.clone(), e))?;
            let raw: serde_yaml::Value = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::Parse(path.clone(), e))?;
            persisted_id = raw.get("node_id").is_some();
            if !raw.is_null() {
                config = serde_yaml::from_value(raw)
                    .map_err(|e| ConfigError::Parse(path.clone(), e))?;
            }
            config.config_file = Some(path.clone());
        }

        let from_env = config.apply_env(&env)?;
        config.validate()?;

        if !persisted_id && !from_env.contains(&"PEERSYNC_NODE_ID") {
            match config.save(&path) {
                Ok(()) => {
                    tracing::info!("Generated node id {} (saved to {})", config.node_id, path.display());
                    config.config_file = Some(path);
                }
                Err(e) => tracing::warn!("Could not persist generated node id: {}", e),
            }
        }

        Ok(config)
    }

    /// Applies `PEERSYNC_*` overrides, returning the variables that were set.
    fn apply_env<F>(&mut self, env: &F) -> Result<Vec<&'static str>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();

        macro_rules! override_with {
            ($var:literal, $field:expr, $parse:expr) => {
                if let Some(raw) = env($var) {
                    $field = $parse(raw.as_str()).ok_or_else(|| ConfigError::InvalidEnv {
                        var: $var,
                        value: raw.clone(),
                    })?;
                    applied.push($var);
                }
            };
        }

        let text = |s: &str| Some(s.to_string());
        let number_u16 = |s: &str| s.trim().parse::<u16>().ok();
        let number_u64 = |s: &str| s.trim().parse::<u64>().ok();
        let number_usize = |s: &str| s.trim().parse::<usize>().ok();
        let flag = |s: &str| match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        };
        let path = |s: &str| Some(PathBuf::from(s));
        let list = |s: &str| {
            Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>(),
            )
        };

        override_with!("PEERSYNC_NODE_ID", self.node_id, text);
        override_with!("PEERSYNC_HOST", self.host, text);
        override_with!("PEERSYNC_API_PORT", self.api_port, number_u16);
        override_with!("PEERSYNC_DISCOVERY_PORT", self.discovery_port, number_u16);
        override_with!("PEERSYNC_SYNC_INTERVAL", self.sync_interval, number_u64);
        override_with!("PEERSYNC_SYNC_TABLES", self.sync_tables, list);
        override_with!("PEERSYNC_MAX_PEERS", self.max_peers, number_usize);
        override_with!("PEERSYNC_AUTO_DISCOVERY", self.enable_auto_discovery, flag);
        override_with!("PEERSYNC_WEBSOCKET_SYNC", self.enable_websocket_sync, flag);
        override_with!("PEERSYNC_HEALTH_CHECK_INTERVAL", self.health_check_interval, number_u64);
        override_with!("PEERSYNC_EVICTION_GRACE_PERIOD", self.eviction_grace_period, number_u64);
        override_with!("PEERSYNC_DATABASE_PATH", self.database_path, path);

        Ok(applied)
    }

    /// Checks invariants the rest of the node relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.sync_interval == 0 {
            return Err(ConfigError::Invalid("sync_interval must be positive".into()));
        }
        if self.health_check_interval == 0 {
            return Err(ConfigError::Invalid(
                "health_check_interval must be positive".into(),
            ));
        }
        for table in &self.sync_tables {
            if schema::lookup(table).is_none() {
                return Err(ConfigError::UnknownTable(table.clone()));
            }
        }
        Ok(())
    }

    /// Writes the configuration as YAML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write(path.to_path_buf(), e))?;
        }
        let yaml = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::Write(path.to_path_buf(), e))
    }

    /// Default config file path: ~/.config/peersync/node.yaml
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peersync")
            .join("node.yaml")
    }

    /// Schema of a table, if this node replicates it.
    pub fn sync_table(&self, name: &str) -> Option<&'static TableSchema> {
        if self.sync_tables.iter().any(|t| t == name) {
            schema::lookup(name)
        } else {
            None
        }
    }

    /// Schemas of every replicated table, in configured order.
    pub fn sync_schemas(&self) -> Vec<&'static TableSchema> {
        self.sync_tables
            .iter()
            .filter_map(|t| schema::lookup(t))
            .collect()
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn eviction_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.eviction_grace_period.min(u32::MAX as u64) as i64)
    }

    /// Whether local changes should trigger an immediate targeted sync.
    pub fn low_latency(&self) -> bool {
        self.sync_interval < LOW_LATENCY_THRESHOLD
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, #[source] serde_yaml::Error),
    #[error("Failed to write config file '{}': {1}", .0.display())]
    Write(PathBuf, #[source] std::io::Error),
    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("Table '{0}' cannot be replicated")]
    UnknownTable(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
