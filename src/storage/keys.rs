//! Key layout
//!
//! ```text
//! services/{cluster}/{service_id}          replicated service
//! instances/{cluster}/{instance_id}        replicated instance, origin id
//! mappings/{cluster}/{origin_instance_id}  mapping entry
//! local/instances/{current_instance_id}    re-identified local replica
//! meta/{name}                              backend metadata
//! ```
//!
//! Cluster names never contain `/`, so each cluster's records form one
//! contiguous prefix range.

use crate::error::{SyncError, SyncResult};

pub const SERVICES_PREFIX: &str = "services/";
pub const INSTANCES_PREFIX: &str = "instances/";
pub const MAPPINGS_PREFIX: &str = "mappings/";
pub const LOCAL_INSTANCES_PREFIX: &str = "local/instances/";
pub const META_PREFIX: &str = "meta/";

pub fn validate_cluster(cluster: &str) -> SyncResult<()> {
    if cluster.is_empty() {
        return Err(SyncError::InvalidArgument(
            "cluster name must not be empty".to_string(),
        ));
    }
    if cluster.contains('/') {
        return Err(SyncError::InvalidArgument(format!(
            "cluster name '{}' must not contain '/'",
            cluster
        )));
    }
    Ok(())
}

pub fn service_prefix(cluster: &str) -> String {
    format!("{}{}/", SERVICES_PREFIX, cluster)
}

pub fn service_key(cluster: &str, service_id: &str) -> String {
    format!("{}{}/{}", SERVICES_PREFIX, cluster, service_id)
}

pub fn instance_prefix(cluster: &str) -> String {
    format!("{}{}/", INSTANCES_PREFIX, cluster)
}

pub fn instance_key(cluster: &str, instance_id: &str) -> String {
    format!("{}{}/{}", INSTANCES_PREFIX, cluster, instance_id)
}

pub fn mapping_prefix(cluster: &str) -> String {
    format!("{}{}/", MAPPINGS_PREFIX, cluster)
}

pub fn mapping_key(cluster: &str, origin_instance_id: &str) -> String {
    format!("{}{}/{}", MAPPINGS_PREFIX, cluster, origin_instance_id)
}

pub fn local_instance_key(current_instance_id: &str) -> String {
    format!("{}{}", LOCAL_INSTANCES_PREFIX, current_instance_id)
}

pub fn meta_key(name: &str) -> String {
    format!("{}{}", META_PREFIX, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_validation() {
        assert!(validate_cluster("dc2").is_ok());
        assert!(validate_cluster("").is_err());
        assert!(validate_cluster("dc/2").is_err());
    }

    #[test]
    fn test_cluster_prefixes_do_not_overlap() {
        // "dc1" must not match records of "dc10"
        assert!(!service_key("dc10", "s1").starts_with(&service_prefix("dc1")));
        assert!(instance_key("dc1", "i1").starts_with(&instance_prefix("dc1")));
        assert!(mapping_key("dc1", "i1").starts_with(MAPPINGS_PREFIX));
    }

    #[test]
    fn test_local_and_meta_keys() {
        assert_eq!(local_instance_key("abc"), "local/instances/abc");
        assert_eq!(meta_key("peer_url"), "meta/peer_url");
    }
}
