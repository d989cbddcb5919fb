use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tag holding the gossip group a member belongs to
pub const TAG_CLUSTER: &str = "cluster";
/// Tag holding the storage backend peer port
pub const TAG_CLUSTER_PORT: &str = "cluster_port";
/// Tag holding the sync server port
pub const TAG_RPC_PORT: &str = "rpc_port";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl MemberStatus {
    /// Ordering used to break ties between views with equal heartbeat
    pub(crate) fn severity(self) -> u8 {
        match self {
            MemberStatus::Alive => 0,
            MemberStatus::Suspect => 1,
            MemberStatus::Dead => 2,
            MemberStatus::Left => 3,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, MemberStatus::Alive | MemberStatus::Suspect)
    }
}

/// A process taking part in gossip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    /// Advertised host
    pub address: String,
    pub gossip_port: u16,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub status: MemberStatus,
    pub heartbeat: u64,
    /// Local receive time of the last heartbeat progress, unix millis.
    /// Never trusted from the wire.
    #[serde(skip)]
    pub last_seen: u64,
}

impl Member {
    pub fn new(name: impl Into<String>, address: impl Into<String>, gossip_port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            gossip_port,
            tags: BTreeMap::new(),
            status: MemberStatus::Alive,
            heartbeat: 0,
            last_seen: now_millis(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    fn port_tag(&self, key: &str) -> Option<u16> {
        self.tag(key).and_then(|p| p.parse().ok())
    }

    pub fn group(&self) -> Option<&str> {
        self.tag(TAG_CLUSTER)
    }

    pub fn cluster_port(&self) -> Option<u16> {
        self.port_tag(TAG_CLUSTER_PORT)
    }

    pub fn rpc_port(&self) -> Option<u16> {
        self.port_tag(TAG_RPC_PORT)
    }

    pub fn gossip_addr(&self) -> String {
        format!("{}:{}", self.address, self.gossip_port)
    }

    /// Sync server address, if the member advertises one
    pub fn rpc_addr(&self) -> Option<String> {
        self.rpc_port().map(|port| format!("{}:{}", self.address, port))
    }
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_tags() {
        let member = Member::new("dc1-a", "10.0.0.1", 30190)
            .with_tag(TAG_CLUSTER, "dc1")
            .with_tag(TAG_CLUSTER_PORT, "30192")
            .with_tag(TAG_RPC_PORT, "30191");

        assert_eq!(member.group(), Some("dc1"));
        assert_eq!(member.cluster_port(), Some(30192));
        assert_eq!(member.gossip_addr(), "10.0.0.1:30190");
        assert_eq!(member.rpc_addr().as_deref(), Some("10.0.0.1:30191"));
    }

    #[test]
    fn test_bad_port_tag_is_ignored() {
        let member = Member::new("n", "h", 1).with_tag(TAG_RPC_PORT, "http");
        assert_eq!(member.rpc_port(), None);
        assert_eq!(member.rpc_addr(), None);
    }

    #[test]
    fn test_last_seen_not_serialized() {
        let member = Member::new("n", "h", 1);
        let json = serde_json::to_string(&member).unwrap();
        assert!(!json.contains("last_seen"));

        let decoded: Member = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.last_seen, 0);
    }
}
