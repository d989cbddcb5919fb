pub mod agent;
pub mod config;
pub mod health;
pub mod node;
pub mod state;
pub mod transport;

pub use agent::{MemberEventHandler, MembershipAgent};
pub use config::GossipConfig;
pub use health::{HealthConfig, HealthMonitor};
pub use node::{Member, MemberStatus, TAG_CLUSTER, TAG_CLUSTER_PORT, TAG_RPC_PORT};
pub use state::{MemberEvent, MemberTable};
