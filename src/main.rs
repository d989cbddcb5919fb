use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dcsync::{FileRegistry, MemoryRegistry, RegistrySource, Server, SyncError, SyncerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dcsync")]
#[command(about = "Cross-datacenter registry synchronizer", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Member name, unique within the gossip group
    #[arg(long)]
    node_name: Option<String>,

    /// Gossip group name
    #[arg(long)]
    cluster_name: Option<String>,

    /// Data directory path
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Gossip bind address
    #[arg(long)]
    gossip_addr: Option<String>,

    /// Host advertised to peers
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Seed gossip addresses (e.g., --join 10.0.0.2:30190)
    #[arg(long = "join")]
    join: Vec<String>,

    /// Sync server bind address
    #[arg(long)]
    rpc_addr: Option<String>,

    /// Port advertised for the storage cluster
    #[arg(long)]
    cluster_port: Option<u16>,

    /// Seconds between sync rounds
    #[arg(long)]
    ticker_interval_secs: Option<u64>,

    /// Seconds a single pull may take
    #[arg(long)]
    pull_timeout_secs: Option<u64>,

    /// Milliseconds between gossip rounds
    #[arg(long)]
    gossip_interval_ms: Option<u64>,

    /// Milliseconds without heartbeat before a member is suspect
    #[arg(long)]
    suspect_after_ms: Option<u64>,

    /// Milliseconds without heartbeat before a member is dead
    #[arg(long)]
    dead_after_ms: Option<u64>,

    /// Shared secret file for transport authentication
    #[arg(long)]
    keyfile: Option<PathBuf>,

    /// JSON registry snapshot served to peers
    #[arg(long)]
    registry_file: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut SyncerConfig) {
        if let Some(v) = self.node_name {
            config.node_name = v;
        }
        if let Some(v) = self.cluster_name {
            config.cluster_name = v;
        }
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.gossip_addr {
            config.gossip_addr = v;
        }
        if let Some(v) = self.advertise_addr {
            config.advertise_addr = v;
        }
        if !self.join.is_empty() {
            config.join = self.join;
        }
        if let Some(v) = self.rpc_addr {
            config.rpc_addr = v;
        }
        if let Some(v) = self.cluster_port {
            config.cluster_port = v;
        }
        if let Some(v) = self.ticker_interval_secs {
            config.ticker_interval_secs = v;
        }
        if let Some(v) = self.pull_timeout_secs {
            config.pull_timeout_secs = v;
        }
        if let Some(v) = self.gossip_interval_ms {
            config.gossip_interval_ms = v;
        }
        if let Some(v) = self.suspect_after_ms {
            config.suspect_after_ms = v;
        }
        if let Some(v) = self.dead_after_ms {
            config.dead_after_ms = v;
        }
        if let Some(v) = self.keyfile {
            config.keyfile = Some(v);
        }
        if let Some(v) = self.registry_file {
            config.registry_file = Some(v);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dcsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = SyncerConfig::load(args.config.take().as_deref())?;
    args.apply(&mut config);
    tracing::info!("Node name: {}", config.node_name);

    let registry: Arc<dyn RegistrySource> = match &config.registry_file {
        Some(path) => {
            tracing::info!("Serving registry from {}", path.display());
            Arc::new(FileRegistry::new(path))
        }
        None => {
            tracing::warn!("No registry file configured, serving an empty registry");
            Arc::new(MemoryRegistry::default())
        }
    };

    let server = Server::new(config, registry)?;
    match server.run().await {
        Ok(()) => {}
        // Asked to stop before startup finished
        Err(SyncError::Stopped) => tracing::info!("Stopped during startup"),
        Err(e) => {
            tracing::error!("dcsync exited: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_every_tuning_field() {
        let args = Args::try_parse_from([
            "dcsync",
            "--cluster-name",
            "dc2",
            "--join",
            "10.0.0.2:30190",
            "--join",
            "10.0.0.3:30190",
            "--cluster-port",
            "40192",
            "--ticker-interval-secs",
            "5",
            "--pull-timeout-secs",
            "7",
            "--gossip-interval-ms",
            "250",
            "--suspect-after-ms",
            "1000",
            "--dead-after-ms",
            "3000",
        ])
        .unwrap();

        let mut config = SyncerConfig::default();
        args.apply(&mut config);

        assert_eq!(config.cluster_name, "dc2");
        assert_eq!(config.join.len(), 2);
        assert_eq!(config.cluster_port, 40192);
        assert_eq!(config.ticker_interval_secs, 5);
        assert_eq!(config.pull_timeout_secs, 7);
        assert_eq!(config.gossip_interval_ms, 250);
        assert_eq!(config.suspect_after_ms, 1000);
        assert_eq!(config.dead_after_ms, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_absent_flags_keep_loaded_values() {
        let args = Args::try_parse_from(["dcsync"]).unwrap();
        let mut config = SyncerConfig {
            cluster_port: 40000,
            ..SyncerConfig::default()
        };
        args.apply(&mut config);
        assert_eq!(config.cluster_port, 40000);
        assert_eq!(config.pull_timeout_secs, SyncerConfig::default().pull_timeout_secs);
    }
}
