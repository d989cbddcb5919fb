use std::sync::Arc;
use std::time::Duration;

use super::node::{now_millis, MemberStatus};
use super::state::{MemberEvent, MemberTable};

/// Configuration for failure detection
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub suspect_after: Duration,
    pub dead_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            suspect_after: Duration::from_secs(5),
            dead_after: Duration::from_secs(15),
        }
    }
}

/// Marks peers whose heartbeat stopped advancing
pub struct HealthMonitor {
    config: HealthConfig,
    table: Arc<MemberTable>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, table: Arc<MemberTable>) -> Self {
        Self { config, table }
    }

    pub fn check_members(&self) -> Vec<MemberEvent> {
        self.check_members_at(now_millis())
    }

    pub(crate) fn check_members_at(&self, now: u64) -> Vec<MemberEvent> {
        let mut events = Vec::new();

        for member in self.table.members() {
            if member.name == self.table.local_name() || !member.status.is_live() {
                continue;
            }

            let elapsed = Duration::from_millis(now.saturating_sub(member.last_seen));
            if elapsed > self.config.dead_after {
                tracing::warn!(
                    "Member {} failed: no heartbeat for {:?}",
                    member.name,
                    elapsed
                );
                events.extend(self.table.mark_status(&member.name, MemberStatus::Dead));
            } else if elapsed > self.config.suspect_after && member.status == MemberStatus::Alive {
                tracing::debug!("Member {} is suspect", member.name);
                self.table.mark_status(&member.name, MemberStatus::Suspect);
            }
        }

        events
    }
}
