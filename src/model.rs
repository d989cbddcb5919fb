//! Replicated registry records
//!
//! Services and instances are owned by the cluster that issued them. A
//! [`Snapshot`] is one cluster's full registry state at the moment it was
//! pulled, and a [`MappingEntry`] binds a foreign instance to the id it was
//! given locally.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// A microservice definition. Identity is `service_id`, unique per cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_id: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Registration time, unix millis
    #[serde(default)]
    pub timestamp: i64,
}

impl ServiceRecord {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    #[default]
    Unknown,
}

/// A running instance of a service. Identity is `instance_id`, unique within
/// the cluster that issued it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub service_id: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Last heartbeat, unix millis
    #[serde(default)]
    pub heartbeat_at: i64,
}

impl InstanceRecord {
    pub fn new(instance_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_id: service_id.into(),
            ..Default::default()
        }
    }
}

/// Complete registry state of one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
}

impl Snapshot {
    pub fn new(services: Vec<ServiceRecord>, instances: Vec<InstanceRecord>) -> Self {
        Self {
            services,
            instances,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.instances.is_empty()
    }

    pub fn service_ids(&self) -> HashSet<&str> {
        self.services.iter().map(|s| s.service_id.as_str()).collect()
    }

    pub fn instance_ids(&self) -> HashSet<&str> {
        self.instances.iter().map(|i| i.instance_id.as_str()).collect()
    }
}

/// Binds `(cluster_name, origin_instance_id)` to the id the instance carries
/// in this cluster. At most one entry exists per key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MappingEntry {
    pub cluster_name: String,
    pub origin_instance_id: String,
    pub current_instance_id: String,
}

impl MappingEntry {
    pub fn new(
        cluster_name: impl Into<String>,
        origin_instance_id: impl Into<String>,
        current_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            origin_instance_id: origin_instance_id.into(),
            current_instance_id: current_instance_id.into(),
        }
    }
}
