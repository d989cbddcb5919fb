use std::time::Duration;

use uuid::Uuid;

use super::health::HealthConfig;

/// Configuration for the gossip agent
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Unique name for this member
    pub node_name: String,

    /// Group the member joins; peers with the same group form one backend cluster
    pub group: String,

    /// Gossip listen address (host:port). Port 0 picks a free port.
    pub bind_addr: String,

    /// Host advertised to peers
    pub advertise_addr: String,

    /// Seed gossip addresses (host:port)
    pub seeds: Vec<String>,

    /// Extra tags advertised with the local member
    pub tags: Vec<(String, String)>,

    pub gossip_interval: Duration,
    pub health: HealthConfig,

    /// Bound for a single gossip exchange
    pub exchange_timeout: Duration,
}

impl GossipConfig {
    pub fn new(node_name: Option<String>, group: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        Self {
            node_name: node_name.unwrap_or_else(default_node_name),
            group: group.into(),
            bind_addr: bind_addr.into(),
            advertise_addr: "127.0.0.1".to_string(),
            seeds: Vec::new(),
            tags: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            health: HealthConfig::default(),
            exchange_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<String>) -> Self {
        // Strip protocol prefixes to handle copy-pasted URLs
        self.seeds = seeds
            .into_iter()
            .map(|s| {
                let s = s.trim();
                s.strip_prefix("http://")
                    .or_else(|| s.strip_prefix("https://"))
                    .unwrap_or(s)
                    .to_string()
            })
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

/// Hostname plus a random suffix
pub fn default_node_name() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", hostname, &Uuid::new_v4().to_string()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_node_name() {
        let config = GossipConfig::new(None, "dc1", "127.0.0.1:0");
        assert!(!config.node_name.is_empty());
        assert_ne!(default_node_name(), default_node_name());
    }

    #[test]
    fn test_seed_normalization() {
        let config = GossipConfig::new(Some("n1".into()), "dc1", "127.0.0.1:0").with_seeds(vec![
            " http://10.0.0.1:30190".to_string(),
            "https://10.0.0.2:30190".to_string(),
            "10.0.0.3:30190".to_string(),
            "  ".to_string(),
        ]);
        assert_eq!(
            config.seeds,
            vec!["10.0.0.1:30190", "10.0.0.2:30190", "10.0.0.3:30190"]
        );
    }
}
