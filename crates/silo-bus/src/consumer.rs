use crate::group::{GroupCoordinator, MemberId};
use crate::offsets::OffsetStore;
use crate::topic::Topic;
use crate::{Error, Message, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A message delivered to a consumer, with its position on the bus
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub message: Message,
}

/// A lazy, restartable subscription for one consumer-group member.
///
/// Polling replays from the group's last committed offset per owned
/// partition. Progress is durable only after [`Consumer::commit_record`] /
/// [`Consumer::commit_all`]. Callers commit strictly after a message's side
/// effects are applied, which is what makes redelivery (at-least-once) the
/// worst case instead of loss.
pub struct Consumer {
    topic: Arc<Topic>,
    group: String,
    member: MemberId,
    offsets: Arc<OffsetStore>,
    coordinator: Arc<GroupCoordinator>,
    closed: Arc<AtomicBool>,
    /// Next offset to fetch per owned partition
    positions: HashMap<u32, u64>,
}

impl Consumer {
    pub(crate) fn new(
        topic: Arc<Topic>,
        group: String,
        member: MemberId,
        offsets: Arc<OffsetStore>,
        coordinator: Arc<GroupCoordinator>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            topic,
            group,
            member,
            offsets,
            coordinator,
            closed,
            positions: HashMap::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn topic_name(&self) -> &str {
        self.topic.name()
    }

    /// Partitions currently owned by this member
    pub fn assignments(&self) -> Vec<u32> {
        self.coordinator.assignments(
            self.topic.name(),
            &self.group,
            self.member,
            self.topic.num_partitions(),
        )
    }

    /// Fetch up to `max_per_partition` messages from every owned partition.
    ///
    /// Ownership is re-resolved on each poll so membership changes take
    /// effect without an explicit rebalance callback: revoked partitions are
    /// dropped (their new owner resumes from the committed offset), newly
    /// assigned ones start from the group's committed position.
    pub async fn poll(&mut self, max_per_partition: usize) -> Result<Vec<ConsumerRecord>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::unavailable("bus is closed"));
        }
        if !self
            .coordinator
            .is_member(self.topic.name(), &self.group, self.member)
        {
            return Err(Error::NotAMember(self.group.clone()));
        }

        let owned = self.assignments();
        self.positions.retain(|partition, _| owned.contains(partition));

        let mut records = Vec::new();
        for partition in owned {
            let position = match self.positions.get(&partition) {
                Some(position) => *position,
                None => {
                    let committed = self
                        .offsets
                        .fetch(&self.group, self.topic.name(), partition)
                        .unwrap_or(0);
                    debug!(
                        topic = self.topic.name(),
                        group = %self.group,
                        partition,
                        committed,
                        "Resuming partition from committed offset"
                    );
                    self.positions.insert(partition, committed);
                    committed
                }
            };

            let messages = self.topic.read(partition, position, max_per_partition).await?;
            if let Some(last) = messages.last() {
                self.positions.insert(partition, last.offset + 1);
            }
            records.extend(messages.into_iter().map(|message| ConsumerRecord {
                topic: self.topic.name().to_string(),
                partition,
                offset: message.offset,
                message,
            }));
        }

        Ok(records)
    }

    /// Rewind a partition so the next poll re-fetches from `offset`.
    ///
    /// Used by stage runners to retry a message whose side effects failed
    /// transiently: the uncommitted message is simply fetched again.
    pub fn seek(&mut self, partition: u32, offset: u64) {
        self.positions.insert(partition, offset);
    }

    /// Durably record that everything up to and including `record` has had
    /// its side effects applied.
    pub fn commit_record(&self, record: &ConsumerRecord) -> Result<()> {
        self.offsets.commit(
            &self.group,
            self.topic.name(),
            record.partition,
            record.offset + 1,
        )
    }

    /// Commit the current fetch position of every owned partition
    pub fn commit_all(&self) -> Result<()> {
        for (partition, position) in &self.positions {
            self.offsets
                .commit(&self.group, self.topic.name(), *partition, *position)?;
        }
        Ok(())
    }

    /// Current fetch position for a partition, if it has been polled
    pub fn position(&self, partition: u32) -> Option<u64> {
        self.positions.get(&partition).copied()
    }

    /// Leave the consumer group. The next member poll picks up the
    /// partitions this instance owned.
    pub fn close(self) {
        self.coordinator
            .leave(self.topic.name(), &self.group, self.member);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.coordinator
            .leave(self.topic.name(), &self.group, self.member);
    }
}
