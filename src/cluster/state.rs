use std::collections::HashMap;

use parking_lot::RwLock;

use super::node::{now_millis, Member, MemberStatus};

/// Membership change observed while merging gossip or sweeping health
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Join(Member),
    Leave(Member),
    Failed(Member),
    Update(Member),
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Join(m)
            | MemberEvent::Leave(m)
            | MemberEvent::Failed(m)
            | MemberEvent::Update(m) => m,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MemberEvent::Join(_) => "member-join",
            MemberEvent::Leave(_) => "member-leave",
            MemberEvent::Failed(_) => "member-failed",
            MemberEvent::Update(_) => "member-update",
        }
    }
}

fn transition(old: Option<&Member>, new: &Member) -> Option<MemberEvent> {
    let was_live = old.is_some_and(|m| m.status.is_live());
    match (was_live, new.status) {
        (false, status) if status.is_live() => Some(MemberEvent::Join(new.clone())),
        (true, MemberStatus::Left) => Some(MemberEvent::Leave(new.clone())),
        (true, MemberStatus::Dead) => Some(MemberEvent::Failed(new.clone())),
        (true, _) => match old {
            Some(old) if old.address != new.address
                || old.gossip_port != new.gossip_port
                || old.tags != new.tags =>
            {
                Some(MemberEvent::Update(new.clone()))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Membership table of one gossip agent, keyed by member name
pub struct MemberTable {
    local_name: String,
    members: RwLock<HashMap<String, Member>>,
}

impl MemberTable {
    pub fn new(local: Member) -> Self {
        let local_name = local.name.clone();
        let mut members = HashMap::new();
        members.insert(local_name.clone(), local);
        Self {
            local_name,
            members: RwLock::new(members),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn local(&self) -> Member {
        // The local entry is inserted at construction and never removed
        self.members
            .read()
            .get(&self.local_name)
            .cloned()
            .unwrap_or_else(|| Member::new(self.local_name.clone(), "", 0))
    }

    pub fn update_local<F: FnOnce(&mut Member)>(&self, f: F) -> Member {
        let mut members = self.members.write();
        let local = members
            .entry(self.local_name.clone())
            .or_insert_with(|| Member::new(self.local_name.clone(), "", 0));
        f(local);
        local.last_seen = now_millis();
        local.clone()
    }

    /// Advances the local heartbeat
    pub fn bump_local(&self) -> Member {
        self.update_local(|m| {
            m.heartbeat += 1;
            m.status = MemberStatus::Alive;
        })
    }

    pub fn get(&self, name: &str) -> Option<Member> {
        self.members.read().get(name).cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Live members tagged with `group`, self included
    pub fn group_members(&self, group: &str) -> Vec<Member> {
        self.members()
            .into_iter()
            .filter(|m| m.status.is_live() && m.group() == Some(group))
            .collect()
    }

    /// Live members other than self
    pub fn live_peers(&self) -> Vec<Member> {
        self.members()
            .into_iter()
            .filter(|m| m.name != self.local_name && m.status.is_live())
            .collect()
    }

    /// Merges one remote view of a member.
    ///
    /// A higher heartbeat always wins. At equal heartbeat the more severe
    /// status wins, so `Left` is never undone without fresh heartbeats.
    /// Claims that the local member is down are refuted by advancing the
    /// local heartbeat past them.
    pub fn merge(&self, remote: Member) -> Option<MemberEvent> {
        let mut members = self.members.write();

        if remote.name == self.local_name {
            if let Some(local) = members.get_mut(&self.local_name) {
                if remote.heartbeat >= local.heartbeat && remote.status != MemberStatus::Alive {
                    local.heartbeat = remote.heartbeat + 1;
                    local.status = MemberStatus::Alive;
                    tracing::debug!(
                        "Refuting {:?} claim about local member at heartbeat {}",
                        remote.status,
                        remote.heartbeat
                    );
                }
            }
            return None;
        }

        let existing = members.get(&remote.name);
        let accepted = match existing {
            None => remote.status.is_live(),
            Some(current) if remote.heartbeat > current.heartbeat => true,
            Some(current) => {
                remote.heartbeat == current.heartbeat
                    && remote.status.severity() > current.status.severity()
            }
        };
        if !accepted {
            return None;
        }

        let event = transition(existing, &remote);
        let progressed = existing.map_or(true, |c| remote.heartbeat > c.heartbeat);
        let mut updated = remote;
        updated.last_seen = match existing {
            Some(current) if !progressed => current.last_seen,
            _ => now_millis(),
        };
        members.insert(updated.name.clone(), updated);
        event
    }

    pub fn merge_all(&self, remote: impl IntoIterator<Item = Member>) -> Vec<MemberEvent> {
        remote.into_iter().filter_map(|m| self.merge(m)).collect()
    }

    /// Sets a peer's status without a heartbeat change
    pub(crate) fn mark_status(&self, name: &str, status: MemberStatus) -> Option<MemberEvent> {
        if name == self.local_name {
            return None;
        }
        let mut members = self.members.write();
        let member = members.get_mut(name)?;
        if member.status == status {
            return None;
        }
        let old = member.clone();
        member.status = status;
        transition(Some(&old), member)
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&self, name: &str, last_seen: u64) {
        if let Some(member) = self.members.write().get_mut(name) {
            member.last_seen = last_seen;
        }
    }
}
