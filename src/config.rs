//! Syncer configuration
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables (a `.env` file in the working directory is honored), then by
//! command-line flags in `main`.
//!
//! ## Environment Variables
//!
//! - `DCSYNC_NODE_NAME` - Member name, unique in the gossip group
//! - `DCSYNC_CLUSTER_NAME` - Gossip group name
//! - `DCSYNC_DATA_DIR` - RocksDB directory
//! - `DCSYNC_GOSSIP_ADDR` - Gossip bind address
//! - `DCSYNC_ADVERTISE_ADDR` - Host advertised to peers
//! - `DCSYNC_JOIN` - Comma-separated seed gossip addresses
//! - `DCSYNC_RPC_ADDR` - Sync server bind address
//! - `DCSYNC_CLUSTER_PORT` - Advertised storage peer port
//! - `DCSYNC_TICKER_INTERVAL_SECS` - Seconds between sync rounds
//! - `DCSYNC_PULL_TIMEOUT_SECS` - Bound for a single pull
//! - `DCSYNC_KEYFILE` - Shared secret for transport authentication
//! - `DCSYNC_REGISTRY_FILE` - JSON snapshot served to peers

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::config::default_node_name;
use crate::cluster::{GossipConfig, HealthConfig, TAG_CLUSTER_PORT, TAG_RPC_PORT};
use crate::error::{SyncError, SyncResult};
use crate::sync::Keyfile;

pub const ENV_PREFIX: &str = "DCSYNC_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncerConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_gossip_addr")]
    pub gossip_addr: String,
    #[serde(default = "default_advertise_addr")]
    pub advertise_addr: String,
    #[serde(default)]
    pub join: Vec<String>,
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: String,
    #[serde(default = "default_cluster_port")]
    pub cluster_port: u16,
    #[serde(default = "default_ticker_interval")]
    pub ticker_interval_secs: u64,
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
    #[serde(default = "default_suspect_after")]
    pub suspect_after_ms: u64,
    #[serde(default = "default_dead_after")]
    pub dead_after_ms: u64,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default)]
    pub registry_file: Option<PathBuf>,
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_gossip_addr() -> String {
    "0.0.0.0:30190".to_string()
}

fn default_advertise_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_addr() -> String {
    "0.0.0.0:30191".to_string()
}

fn default_cluster_port() -> u16 {
    30192
}

fn default_ticker_interval() -> u64 {
    30
}

fn default_pull_timeout() -> u64 {
    30
}

fn default_gossip_interval() -> u64 {
    1000
}

fn default_suspect_after() -> u64 {
    5000
}

fn default_dead_after() -> u64 {
    15000
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            cluster_name: default_cluster_name(),
            data_dir: default_data_dir(),
            gossip_addr: default_gossip_addr(),
            advertise_addr: default_advertise_addr(),
            join: Vec::new(),
            rpc_addr: default_rpc_addr(),
            cluster_port: default_cluster_port(),
            ticker_interval_secs: default_ticker_interval(),
            pull_timeout_secs: default_pull_timeout(),
            gossip_interval_ms: default_gossip_interval(),
            suspect_after_ms: default_suspect_after(),
            dead_after_ms: default_dead_after(),
            keyfile: None,
            registry_file: None,
        }
    }
}

impl SyncerConfig {
    /// Loads `path` if given (defaults otherwise) and applies environment
    /// overrides. Does not validate.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                toml::from_str(&content).map_err(|e| {
                    SyncError::Config(format!("Invalid config {}: {}", path.display(), e))
                })?
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies `DCSYNC_*` overrides from `lookup`. Empty or unparsable
    /// values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = var("NODE_NAME") {
            self.node_name = v;
        }
        if let Some(v) = var("CLUSTER_NAME") {
            self.cluster_name = v;
        }
        if let Some(v) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("GOSSIP_ADDR") {
            self.gossip_addr = v;
        }
        if let Some(v) = var("ADVERTISE_ADDR") {
            self.advertise_addr = v;
        }
        if let Some(v) = var("JOIN") {
            self.join = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = var("RPC_ADDR") {
            self.rpc_addr = v;
        }
        if let Some(port) = var("CLUSTER_PORT").and_then(|v| v.parse().ok()) {
            self.cluster_port = port;
        }
        if let Some(secs) = var("TICKER_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.ticker_interval_secs = secs;
        }
        if let Some(secs) = var("PULL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.pull_timeout_secs = secs;
        }
        if let Some(v) = var("KEYFILE") {
            self.keyfile = Some(PathBuf::from(v));
        }
        if let Some(v) = var("REGISTRY_FILE") {
            self.registry_file = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        for (field, value) in [("node_name", &self.node_name), ("cluster_name", &self.cluster_name)] {
            if value.trim().is_empty() {
                return Err(SyncError::Config(format!("{} must not be empty", field)));
            }
            if value.contains('/') {
                return Err(SyncError::Config(format!(
                    "{} '{}' must not contain '/'",
                    field, value
                )));
            }
        }

        for (field, value) in [
            ("ticker_interval_secs", self.ticker_interval_secs),
            ("pull_timeout_secs", self.pull_timeout_secs),
            ("gossip_interval_ms", self.gossip_interval_ms),
            ("suspect_after_ms", self.suspect_after_ms),
            ("dead_after_ms", self.dead_after_ms),
        ] {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be positive", field)));
            }
        }
        if self.dead_after_ms < self.suspect_after_ms {
            return Err(SyncError::Config(
                "dead_after_ms must not be shorter than suspect_after_ms".to_string(),
            ));
        }

        self.rpc_addr.parse::<SocketAddr>().map_err(|e| {
            SyncError::Config(format!("Invalid rpc_addr '{}': {}", self.rpc_addr, e))
        })?;
        Ok(())
    }

    pub fn ticker_interval(&self) -> Duration {
        Duration::from_secs(self.ticker_interval_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    /// Port advertised for the sync server; 0 until bound when `rpc_addr`
    /// asks for an ephemeral port.
    pub fn rpc_port(&self) -> u16 {
        self.rpc_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    pub fn gossip_config(&self) -> GossipConfig {
        let mut gossip = GossipConfig::new(
            Some(self.node_name.clone()),
            self.cluster_name.clone(),
            self.gossip_addr.clone(),
        )
        .with_seeds(self.join.clone())
        .with_tag(TAG_CLUSTER_PORT, self.cluster_port.to_string())
        .with_tag(TAG_RPC_PORT, self.rpc_port().to_string());
        gossip.advertise_addr = self.advertise_addr.clone();
        gossip.gossip_interval = Duration::from_millis(self.gossip_interval_ms);
        gossip.health = HealthConfig {
            suspect_after: Duration::from_millis(self.suspect_after_ms),
            dead_after: Duration::from_millis(self.dead_after_ms),
        };
        gossip
    }

    pub fn load_keyfile(&self) -> SyncResult<Option<Arc<Keyfile>>> {
        match &self.keyfile {
            Some(path) => Ok(Some(Arc::new(Keyfile::load(path)?))),
            None => Ok(None),
        }
    }
}
