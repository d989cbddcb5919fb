//! Common test utilities
//!
//! Provides shared helper functions for:
//! - Creating reconcilers over temporary RocksDB directories
//! - Building snapshots
//! - Configuring in-process syncers on ephemeral ports

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use dcsync::{InstanceRecord, Reconciler, ServiceRecord, Snapshot, SyncerConfig};
use tempfile::TempDir;

pub fn create_test_reconciler() -> (Reconciler, TempDir) {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let reconciler = Reconciler::open(tmp_dir.path()).expect("Failed to open reconciler");
    (reconciler, tmp_dir)
}

/// Services by id, instances as `(instance_id, service_id)`
pub fn snapshot(services: &[&str], instances: &[(&str, &str)]) -> Snapshot {
    Snapshot::new(
        services.iter().map(|id| ServiceRecord::new(*id)).collect(),
        instances
            .iter()
            .map(|(id, svc)| InstanceRecord::new(*id, *svc))
            .collect(),
    )
}

/// Config bound to loopback ephemeral ports with fast gossip
pub fn test_config(name: &str, group: &str, data_dir: &Path, join: Vec<String>) -> SyncerConfig {
    SyncerConfig {
        node_name: name.to_string(),
        cluster_name: group.to_string(),
        data_dir: data_dir.join(name),
        gossip_addr: "127.0.0.1:0".to_string(),
        advertise_addr: "127.0.0.1".to_string(),
        join,
        rpc_addr: "127.0.0.1:0".to_string(),
        ticker_interval_secs: 1,
        pull_timeout_secs: 5,
        gossip_interval_ms: 100,
        suspect_after_ms: 2000,
        dead_after_ms: 5000,
        ..SyncerConfig::default()
    }
}

/// Polls `check` until it holds or `timeout` elapses
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
