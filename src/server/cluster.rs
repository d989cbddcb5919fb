use url::Url;

use crate::cluster::Member;
use crate::error::{SyncError, SyncResult};
use crate::storage::BackendClusterConfig;

/// Derives the storage cluster layout from gossip membership.
///
/// The local peer URL is built from the local member's address and
/// `cluster_port`. Every member advertising a `cluster_port` tag
/// contributes one `name=http://address:port` entry; no entries at all
/// means there is nothing to form a cluster with.
pub fn configure_cluster(
    local: &Member,
    members: &[Member],
    cluster_port: u16,
    group: &str,
) -> SyncResult<BackendClusterConfig> {
    let peer_url = Url::parse(&format!("http://{}:{}", local.address, cluster_port))
        .map_err(|e| SyncError::Config(format!("Invalid advertise address '{}': {}", local.address, e)))?;

    let initial_cluster = members
        .iter()
        .filter_map(|m| {
            m.cluster_port()
                .map(|port| format!("{}=http://{}:{}", m.name, m.address, port))
        })
        .collect::<Vec<_>>()
        .join(",");

    if initial_cluster.is_empty() {
        return Err(SyncError::EmptyMembership(group.to_string()));
    }

    Ok(BackendClusterConfig {
        name: local.name.clone(),
        peer_url,
        initial_cluster,
    })
}
