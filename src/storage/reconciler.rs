//! Snapshot and mapping reconciliation
//!
//! Each write operation stages all of its upserts and deletes in one
//! `WriteBatch`, so a failed round leaves the previous state untouched and
//! the next round simply re-pulls and re-diffs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::diff;
use super::keys;
use crate::error::{SyncError, SyncResult};
use crate::model::{InstanceRecord, MappingEntry, Snapshot};

/// Outcome of a mapping update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingUpdate {
    pub applied: usize,
    /// Entries without a replicated instance to mirror
    pub skipped: usize,
    pub evicted: usize,
}

impl MappingUpdate {
    fn absorb(&mut self, other: MappingUpdate) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.evicted += other.evicted;
    }
}

pub struct Reconciler {
    db: Arc<DB>,
}

impl Reconciler {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    /// Opens a standalone database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;
        Ok(Self::new(Arc::new(db)))
    }

    /// Replaces everything stored for `cluster` with `snapshot`.
    pub fn update_snapshot(&self, cluster: &str, snapshot: &Snapshot) -> SyncResult<()> {
        keys::validate_cluster(cluster)?;
        let mut batch = WriteBatch::default();
        self.stage_snapshot(&mut batch, cluster, snapshot)?;

        self.db
            .write(batch)
            .map_err(|e| SyncError::Storage(format!("Failed to update snapshot of {}: {}", cluster, e)))
    }

    /// Snapshot replacement and mapping refresh for one pulled peer, written
    /// as a single batch. Mapped instances are mirrored from `snapshot`.
    pub fn apply_round(
        &self,
        cluster: &str,
        snapshot: &Snapshot,
        entries: &[MappingEntry],
    ) -> SyncResult<MappingUpdate> {
        keys::validate_cluster(cluster)?;
        check_cluster(cluster, entries)?;

        let mut batch = WriteBatch::default();
        self.stage_snapshot(&mut batch, cluster, snapshot)?;

        let pulled: HashMap<&str, &InstanceRecord> = snapshot
            .instances
            .iter()
            .map(|i| (i.instance_id.as_str(), i))
            .collect();
        let stored = self.get_mapping(cluster)?;
        let update = self.stage_mappings(&mut batch, cluster, &stored, entries, |origin| {
            Ok(pulled.get(origin).map(|i| (*i).clone()))
        })?;

        self.db
            .write(batch)
            .map_err(|e| SyncError::Storage(format!("Failed to apply round from {}: {}", cluster, e)))?;

        debug!(
            "Mappings of {}: {} applied, {} skipped, {} evicted",
            cluster, update.applied, update.skipped, update.evicted
        );
        Ok(update)
    }

    fn stage_snapshot(&self, batch: &mut WriteBatch, cluster: &str, snapshot: &Snapshot) -> SyncResult<()> {
        let stored = self.get_snapshot(cluster)?;

        let expired_services =
            diff::expired(&stored.services, &snapshot.services, |s| s.service_id.as_str());
        let expired_instances =
            diff::expired(&stored.instances, &snapshot.instances, |i| i.instance_id.as_str());

        for service in &snapshot.services {
            stage_put(batch, keys::service_key(cluster, &service.service_id), service);
        }
        for instance in &snapshot.instances {
            stage_put(batch, keys::instance_key(cluster, &instance.instance_id), instance);
        }
        for service in &expired_services {
            batch.delete(keys::service_key(cluster, &service.service_id));
        }
        for instance in &expired_instances {
            batch.delete(keys::instance_key(cluster, &instance.instance_id));
        }

        debug!(
            "Snapshot of {}: {} services, {} instances, evicted {} services, {} instances",
            cluster,
            snapshot.services.len(),
            snapshot.instances.len(),
            expired_services.len(),
            expired_instances.len()
        );
        Ok(())
    }

    pub fn get_snapshot(&self, cluster: &str) -> SyncResult<Snapshot> {
        keys::validate_cluster(cluster)?;
        Ok(Snapshot::new(
            self.scan(&keys::service_prefix(cluster))?,
            self.scan(&keys::instance_prefix(cluster))?,
        ))
    }

    /// Upserts `entries` for `cluster` and evicts every stored entry whose
    /// local id is no longer among them, together with its local record.
    pub fn update_mapping(&self, cluster: &str, entries: &[MappingEntry]) -> SyncResult<MappingUpdate> {
        keys::validate_cluster(cluster)?;
        check_cluster(cluster, entries)?;

        let stored = self.get_mapping(cluster)?;
        let mut batch = WriteBatch::default();
        let update = self.stage_mappings(&mut batch, cluster, &stored, entries, |origin| {
            self.get_json(&keys::instance_key(cluster, origin))
        })?;

        self.db
            .write(batch)
            .map_err(|e| SyncError::Storage(format!("Failed to update mappings of {}: {}", cluster, e)))?;

        debug!(
            "Mappings of {}: {} applied, {} skipped, {} evicted",
            cluster, update.applied, update.skipped, update.evicted
        );
        Ok(update)
    }

    /// Same as [`update_mapping`](Self::update_mapping) over every cluster at
    /// once; clusters absent from `entries` lose all their mappings.
    pub fn replace_all_mappings(&self, entries: &[MappingEntry]) -> SyncResult<MappingUpdate> {
        let mut wanted: BTreeMap<&str, Vec<MappingEntry>> = BTreeMap::new();
        for entry in entries {
            keys::validate_cluster(&entry.cluster_name)?;
            wanted
                .entry(entry.cluster_name.as_str())
                .or_default()
                .push(entry.clone());
        }

        let mut stored: BTreeMap<String, Vec<MappingEntry>> = BTreeMap::new();
        for entry in self.get_all_mappings()? {
            stored.entry(entry.cluster_name.clone()).or_default().push(entry);
        }

        let clusters: HashSet<&str> = wanted
            .keys()
            .copied()
            .chain(stored.keys().map(String::as_str))
            .collect();

        let mut batch = WriteBatch::default();
        let mut total = MappingUpdate::default();
        for cluster in clusters {
            let old = stored.get(cluster).map(Vec::as_slice).unwrap_or_default();
            let new = wanted.get(cluster).map(Vec::as_slice).unwrap_or_default();
            total.absorb(self.stage_mappings(&mut batch, cluster, old, new, |origin| {
                self.get_json(&keys::instance_key(cluster, origin))
            })?);
        }

        self.db
            .write(batch)
            .map_err(|e| SyncError::Storage(format!("Failed to replace mappings: {}", e)))?;
        Ok(total)
    }

    /// `mirror` resolves an origin instance id to the replicated record the
    /// local one is copied from.
    fn stage_mappings<F>(
        &self,
        batch: &mut WriteBatch,
        cluster: &str,
        stored: &[MappingEntry],
        entries: &[MappingEntry],
        mirror: F,
    ) -> SyncResult<MappingUpdate>
    where
        F: Fn(&str) -> SyncResult<Option<InstanceRecord>>,
    {
        let mut update = MappingUpdate::default();
        let mut applied: Vec<MappingEntry> = Vec::with_capacity(entries.len());

        for entry in entries {
            match mirror(&entry.origin_instance_id)? {
                Some(mut instance) => {
                    instance.instance_id = entry.current_instance_id.clone();
                    stage_put(batch, keys::local_instance_key(&entry.current_instance_id), &instance);
                }
                None if self.get_local_instance(&entry.current_instance_id)?.is_some() => {}
                None => {
                    warn!(
                        "No replicated instance {} from {}, skipping mapping",
                        entry.origin_instance_id, cluster
                    );
                    update.skipped += 1;
                    continue;
                }
            }
            stage_put(batch, keys::mapping_key(cluster, &entry.origin_instance_id), entry);
            applied.push(entry.clone());
        }

        let reused_origins: HashSet<&str> = applied
            .iter()
            .map(|e| e.origin_instance_id.as_str())
            .collect();
        let expired = diff::expired(stored, &applied, |e| e.current_instance_id.as_str());
        for entry in &expired {
            batch.delete(keys::local_instance_key(&entry.current_instance_id));
            if !reused_origins.contains(entry.origin_instance_id.as_str()) {
                batch.delete(keys::mapping_key(cluster, &entry.origin_instance_id));
            }
        }

        update.applied = applied.len();
        update.evicted = expired.len();
        Ok(update)
    }

    pub fn get_mapping(&self, cluster: &str) -> SyncResult<Vec<MappingEntry>> {
        keys::validate_cluster(cluster)?;
        self.scan(&keys::mapping_prefix(cluster))
    }

    pub fn get_all_mappings(&self) -> SyncResult<Vec<MappingEntry>> {
        self.scan(keys::MAPPINGS_PREFIX)
    }

    pub fn get_local_instance(&self, current_instance_id: &str) -> SyncResult<Option<InstanceRecord>> {
        self.get_json(&keys::local_instance_key(current_instance_id))
    }

    pub fn local_instances(&self) -> SyncResult<Vec<InstanceRecord>> {
        self.scan(keys::LOCAL_INSTANCES_PREFIX)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("Skipping undecodable record {}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> SyncResult<Vec<T>> {
        let prefix_bytes = prefix.as_bytes();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix_bytes, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix_bytes) {
                break;
            }
            match serde_json::from_slice(&value) {
                Ok(record) => out.push(record),
                Err(e) => warn!(
                    "Skipping undecodable record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(out)
    }
}

fn check_cluster(cluster: &str, entries: &[MappingEntry]) -> SyncResult<()> {
    match entries.iter().find(|e| e.cluster_name != cluster) {
        Some(foreign) => Err(SyncError::InvalidArgument(format!(
            "mapping for cluster '{}' passed to update of '{}'",
            foreign.cluster_name, cluster
        ))),
        None => Ok(()),
    }
}

fn stage_put<T: Serialize>(batch: &mut WriteBatch, key: String, value: &T) {
    match serde_json::to_vec(value) {
        Ok(bytes) => batch.put(key.as_bytes(), bytes),
        Err(e) => warn!("Skipping unencodable record {}: {}", key, e),
    }
}
