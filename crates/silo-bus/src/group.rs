use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier handed to each consumer instance on subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(Uuid);

impl MemberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Membership key: (topic, consumer group)
type GroupKey = (String, String);

/// Tracks consumer-group membership and owns partition assignment.
///
/// Each partition is owned by at most one member of a group at a time, so
/// per-key ordering survives horizontal scaling. Assignment is range-based
/// over the join order and recomputed on every join/leave; revoked partitions
/// are resumed by their new owner from the last committed offset.
#[derive(Default)]
pub struct GroupCoordinator {
    members: RwLock<HashMap<GroupKey, Vec<MemberId>>>,
}

impl GroupCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer instance in a group
    pub fn join(&self, topic: &str, group: &str) -> MemberId {
        let member = MemberId::new();
        let mut members = self.members.write();
        let entry = members
            .entry((topic.to_string(), group.to_string()))
            .or_default();
        entry.push(member);
        info!(
            topic,
            group,
            member = %member,
            members = entry.len(),
            "Consumer joined group"
        );
        member
    }

    /// Remove a consumer instance; its partitions move to the remaining members
    pub fn leave(&self, topic: &str, group: &str, member: MemberId) {
        let mut members = self.members.write();
        if let Some(entry) = members.get_mut(&(topic.to_string(), group.to_string())) {
            entry.retain(|m| *m != member);
            debug!(topic, group, member = %member, "Consumer left group");
        }
    }

    /// Whether the member is still part of the group
    pub fn is_member(&self, topic: &str, group: &str, member: MemberId) -> bool {
        self.members
            .read()
            .get(&(topic.to_string(), group.to_string()))
            .is_some_and(|entry| entry.contains(&member))
    }

    /// Partitions currently owned by `member` given `num_partitions` in the
    /// topic. Empty when the member has left the group.
    pub fn assignments(
        &self,
        topic: &str,
        group: &str,
        member: MemberId,
        num_partitions: u32,
    ) -> Vec<u32> {
        let members = self.members.read();
        let Some(entry) = members.get(&(topic.to_string(), group.to_string())) else {
            return Vec::new();
        };
        let Some(index) = entry.iter().position(|m| *m == member) else {
            return Vec::new();
        };

        let member_count = entry.len() as u32;
        (0..num_partitions)
            .filter(|partition| partition % member_count == index as u32)
            .collect()
    }
}
