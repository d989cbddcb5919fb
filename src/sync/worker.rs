//! Sync rounds
//!
//! The members of the local gossip group share one storage cluster. A round
//! pulls a full snapshot from one live member of every *other* group,
//! concurrently, and reconciles each into storage under that group's name.
//! A failure abandons only that group's round; the next tick retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::ClientPool;
use crate::cluster::{Member, MemberEvent, MemberEventHandler, MembershipAgent};
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::TickHandler;
use crate::model::{MappingEntry, Snapshot};
use crate::storage::{MappingUpdate, Reconciler};

/// Per-group outcome of one round, by group name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct SyncWorker {
    agent: Arc<MembershipAgent>,
    clients: Arc<ClientPool>,
    reconciler: RwLock<Option<Arc<Reconciler>>>,
    /// Held for the whole of a round
    round: Mutex<()>,
}

impl SyncWorker {
    pub fn new(agent: Arc<MembershipAgent>, clients: Arc<ClientPool>) -> Self {
        Self {
            agent,
            clients,
            reconciler: RwLock::new(None),
            round: Mutex::new(()),
        }
    }

    /// Rounds are no-ops until storage is bound
    pub fn bind_storage(&self, reconciler: Arc<Reconciler>) {
        *self.reconciler.write() = Some(reconciler);
    }

    /// Waits out a round in progress, then releases the storage handle.
    /// Later rounds are no-ops.
    pub async fn unbind_storage(&self) -> Option<Arc<Reconciler>> {
        let _round = self.round.lock().await;
        self.reconciler.write().take()
    }

    pub fn reconciler(&self) -> Option<Arc<Reconciler>> {
        self.reconciler.read().clone()
    }

    pub fn clients(&self) -> &Arc<ClientPool> {
        &self.clients
    }

    /// One member per remote group to pull from, keyed by group name
    pub fn targets(&self) -> BTreeMap<String, Member> {
        select_targets(self.agent.group(), self.agent.members())
    }

    pub async fn run_round(&self, cancel: &CancellationToken) -> RoundReport {
        let _round = self.round.lock().await;
        let mut report = RoundReport::default();
        let Some(reconciler) = self.reconciler.read().clone() else {
            debug!("Sync round skipped, storage not bound");
            return report;
        };

        let targets = self.targets();
        if targets.is_empty() {
            debug!("Sync round: no remote clusters to pull from");
            return report;
        }

        let results = join_all(
            targets
                .iter()
                .map(|(group, member)| self.sync_peer(group, member, &reconciler, cancel)),
        )
        .await;

        for ((group, member), result) in targets.into_iter().zip(results) {
            match result {
                Ok(update) => {
                    debug!(
                        "Synced {} via {}: {} mappings, {} evicted",
                        group, member.name, update.applied, update.evicted
                    );
                    report.succeeded.push(group);
                }
                Err(SyncError::Cancelled) => {
                    debug!("Sync with {} cancelled", group);
                    report.failed.push(group);
                }
                Err(e) => {
                    warn!("Sync with {} via {} failed: {}", group, member.name, e);
                    report.failed.push(group);
                }
            }
        }
        report
    }

    async fn sync_peer(
        &self,
        group: &str,
        member: &Member,
        reconciler: &Arc<Reconciler>,
        cancel: &CancellationToken,
    ) -> SyncResult<MappingUpdate> {
        let addr = member.rpc_addr().ok_or_else(|| {
            SyncError::InvalidArgument(format!("{} advertises no sync port", member.name))
        })?;

        let client = self.clients.get_client(&addr).await?;
        let snapshot = client.pull(cancel).await?;

        let reconciler = reconciler.clone();
        let cluster = group.to_string();
        tokio::task::spawn_blocking(move || reconcile(&reconciler, &cluster, &snapshot))
            .await
            .map_err(|e| SyncError::Storage(format!("reconcile task failed: {}", e)))?
    }

    /// Ticker handler running one round per fire
    pub fn tick_handler(self: &Arc<Self>, cancel: CancellationToken) -> TickHandler {
        let worker = self.clone();
        Arc::new(move || {
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move {
                let report = worker.run_round(&cancel).await;
                if !report.failed.is_empty() {
                    info!(
                        "Sync round finished: {} ok, {} failed",
                        report.succeeded.len(),
                        report.failed.len()
                    );
                }
            }
            .boxed()
        })
    }
}

impl MemberEventHandler for SyncWorker {
    fn handle_event(&self, event: &MemberEvent) {
        if let MemberEvent::Leave(member) | MemberEvent::Failed(member) = event {
            if let Some(addr) = member.rpc_addr() {
                self.clients.remove(&addr);
            }
        }
    }
}

/// Picks one live member advertising a sync port from every group other
/// than `own`. Alive beats suspect; ties go to the lowest name.
pub fn select_targets(own: &str, members: Vec<Member>) -> BTreeMap<String, Member> {
    let mut targets: BTreeMap<String, Member> = BTreeMap::new();
    for member in members {
        if !member.status.is_live() || member.rpc_addr().is_none() {
            continue;
        }
        let Some(group) = member.group().filter(|g| *g != own).map(str::to_string) else {
            continue;
        };
        let better = targets.get(&group).map_or(true, |current| {
            (member.status.severity(), &member.name) < (current.status.severity(), &current.name)
        });
        if better {
            targets.insert(group, member);
        }
    }
    targets
}

/// Stores a pulled snapshot and refreshes the cluster's mappings in one
/// write. Instances keep the local id they were given on first sight.
pub fn reconcile(reconciler: &Reconciler, cluster: &str, snapshot: &Snapshot) -> SyncResult<MappingUpdate> {
    let known: HashMap<String, String> = reconciler
        .get_mapping(cluster)?
        .into_iter()
        .map(|e| (e.origin_instance_id, e.current_instance_id))
        .collect();

    let entries: Vec<MappingEntry> = snapshot
        .instances
        .iter()
        .map(|instance| {
            let current = known
                .get(&instance.instance_id)
                .cloned()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            MappingEntry::new(cluster, instance.instance_id.clone(), current)
        })
        .collect();

    reconciler.apply_round(cluster, snapshot, &entries)
}
