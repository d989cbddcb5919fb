//! Local registry access
//!
//! The sync server answers pulls with whatever [`RegistrySource`] it was
//! built with. The registry itself lives outside this process; the file
//! source reads a JSON export of it on every pull.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::SyncResult;
use crate::model::{InstanceRecord, ServiceRecord, Snapshot};

/// Provides the current state of the local registry.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn snapshot(&self) -> SyncResult<Snapshot>;
}

/// In-memory registry, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: RwLock<Snapshot>,
}

impl MemoryRegistry {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    pub fn replace(&self, snapshot: Snapshot) {
        *self.state.write() = snapshot;
    }

    pub fn upsert_service(&self, service: ServiceRecord) {
        let mut state = self.state.write();
        match state
            .services
            .iter_mut()
            .find(|s| s.service_id == service.service_id)
        {
            Some(existing) => *existing = service,
            None => state.services.push(service),
        }
    }

    pub fn upsert_instance(&self, instance: InstanceRecord) {
        let mut state = self.state.write();
        match state
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance.instance_id)
        {
            Some(existing) => *existing = instance,
            None => state.instances.push(instance),
        }
    }

    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.instances.len();
        state.instances.retain(|i| i.instance_id != instance_id);
        state.instances.len() != before
    }
}

#[async_trait]
impl RegistrySource for MemoryRegistry {
    async fn snapshot(&self) -> SyncResult<Snapshot> {
        Ok(self.state.read().clone())
    }
}

/// Registry exported as a JSON [`Snapshot`] document. A missing file reads as
/// an empty registry.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RegistrySource for FileRegistry {
    async fn snapshot(&self) -> SyncResult<Snapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Registry file {} not found", self.path.display());
                Ok(Snapshot::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}
