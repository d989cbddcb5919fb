//! Local storage backend module
//!
//! Owns the RocksDB handle the reconciler writes through. The backend must
//! be configured with the cluster layout derived from membership before it
//! is started; that layout is recorded under `meta/` on open.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{Options, DB};
use tracing::{info, warn};
use url::Url;

use super::keys;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{Lifecycle, Module, ModuleState, TaskPool};

/// Peer layout of the backing store cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendClusterConfig {
    /// Local member name
    pub name: String,
    /// URL peers reach this member's backend on
    pub peer_url: Url,
    /// Comma-separated `name=url` entries for every known member
    pub initial_cluster: String,
}

impl BackendClusterConfig {
    /// Parses `initial_cluster` back into `(name, url)` pairs
    pub fn peers(&self) -> Vec<(String, String)> {
        self.initial_cluster
            .split(',')
            .filter_map(|entry| {
                let (name, url) = entry.split_once('=')?;
                Some((name.trim().to_string(), url.trim().to_string()))
            })
            .filter(|(name, url)| !name.is_empty() && !url.is_empty())
            .collect()
    }
}

pub struct StorageBackend {
    lifecycle: Lifecycle,
    data_dir: PathBuf,
    cluster: RwLock<Option<BackendClusterConfig>>,
    db: RwLock<Option<Arc<DB>>>,
}

impl StorageBackend {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            lifecycle: Lifecycle::new("storage"),
            data_dir: data_dir.into(),
            cluster: RwLock::new(None),
            db: RwLock::new(None),
        }
    }

    pub fn configure(&self, config: BackendClusterConfig) {
        *self.cluster.write() = Some(config);
    }

    pub fn cluster_config(&self) -> Option<BackendClusterConfig> {
        self.cluster.read().clone()
    }

    /// The open database, once the backend is ready
    pub fn engine(&self) -> SyncResult<Arc<DB>> {
        if self.lifecycle.state() != ModuleState::Ready {
            return Err(SyncError::StorageNotReady);
        }
        self.db.read().clone().ok_or(SyncError::StorageNotReady)
    }

    fn open(path: PathBuf, cluster: &BackendClusterConfig) -> SyncResult<DB> {
        std::fs::create_dir_all(&path)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path)?;

        db.put(keys::meta_key("name"), cluster.name.as_bytes())?;
        db.put(keys::meta_key("peer_url"), cluster.peer_url.as_str().as_bytes())?;
        db.put(
            keys::meta_key("initial_cluster"),
            cluster.initial_cluster.as_bytes(),
        )?;
        Ok(db)
    }
}

#[async_trait]
impl Module for StorageBackend {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn start(self: Arc<Self>, pool: &TaskPool) {
        if !self.lifecycle.mark_starting() {
            return;
        }
        let Some(cluster) = self.cluster_config() else {
            self.lifecycle.fail("cluster configuration missing");
            return;
        };

        pool.spawn(async move {
            let path = self.data_dir.clone();
            let opened = tokio::task::spawn_blocking({
                let cluster = cluster.clone();
                move || Self::open(path, &cluster)
            })
            .await;

            match opened {
                Ok(Ok(db)) => {
                    *self.db.write() = Some(Arc::new(db));
                    info!(
                        "Storage opened at {} for {} ({} peers)",
                        self.data_dir.display(),
                        cluster.name,
                        cluster.peers().len()
                    );
                    self.lifecycle.mark_ready();
                }
                Ok(Err(e)) => {
                    self.lifecycle.fail(e.to_string());
                }
                Err(e) => {
                    self.lifecycle.fail(format!("open task failed: {}", e));
                }
            }
        });
    }

    async fn stop(&self) {
        let released = self.db.write().take();
        let stopped = self.lifecycle.mark_stopped();
        if let Some(db) = released {
            let holders = Arc::strong_count(&db) - 1;
            if holders > 0 {
                warn!("Storage stopped with {} handle(s) still open", holders);
            } else if stopped {
                info!("Storage closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cluster_config() -> BackendClusterConfig {
        BackendClusterConfig {
            name: "n1".to_string(),
            peer_url: Url::parse("http://127.0.0.1:30192").unwrap(),
            initial_cluster: "n1=http://127.0.0.1:30192,n2=http://10.0.0.2:30192".to_string(),
        }
    }

    #[test]
    fn test_peers_parsing() {
        let peers = cluster_config().peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1], ("n2".to_string(), "http://10.0.0.2:30192".to_string()));
    }

    #[tokio::test]
    async fn test_start_without_configuration_fails() {
        let dir = TempDir::new().unwrap();
        let pool = TaskPool::new();
        let backend = Arc::new(StorageBackend::new(dir.path()));

        backend.clone().start(&pool);
        assert!(backend.ready().await.is_err());
        assert!(matches!(backend.engine(), Err(SyncError::StorageNotReady)));
    }

    #[tokio::test]
    async fn test_start_records_cluster_meta() {
        let dir = TempDir::new().unwrap();
        let pool = TaskPool::new();
        let backend = Arc::new(StorageBackend::new(dir.path().join("db")));
        assert!(matches!(backend.engine(), Err(SyncError::StorageNotReady)));

        backend.configure(cluster_config());
        backend.clone().start(&pool);
        backend.ready().await.unwrap();

        let db = backend.engine().unwrap();
        let peer_url = db.get(keys::meta_key("peer_url")).unwrap().unwrap();
        assert_eq!(peer_url, b"http://127.0.0.1:30192/");
        drop(db);

        backend.stop().await;
        backend.stop().await;
        assert!(matches!(backend.engine(), Err(SyncError::StorageNotReady)));
        pool.close_and_wait().await;

        // Closed for real: the path can be opened again
        assert!(DB::open_default(dir.path().join("db")).is_ok());
    }
}
