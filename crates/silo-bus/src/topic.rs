use crate::{BusConfig, Error, Message, Partition, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::info;

/// A named, ordered, durable message channel split into partitions.
///
/// Messages with the same key always land on the same partition, which is
/// what gives the pipeline its per-source ordering guarantee.
#[derive(Debug)]
pub struct Topic {
    name: String,
    partitions: Vec<Arc<Partition>>,
}

impl Topic {
    /// Create (or re-open) a topic with `num_partitions` partitions
    pub fn open(config: &BusConfig, name: String, num_partitions: u32) -> Result<Self> {
        if num_partitions == 0 {
            return Err(Error::InvalidConfig(format!(
                "Topic '{}' needs at least one partition",
                name
            )));
        }

        info!("Opening topic '{}' with {} partitions", name, num_partitions);

        let mut partitions = Vec::with_capacity(num_partitions as usize);
        for id in 0..num_partitions {
            partitions.push(Arc::new(Partition::open(config, &name, id)?));
        }

        Ok(Self { name, partitions })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Get a specific partition
    pub fn partition(&self, partition_id: u32) -> Result<Arc<Partition>> {
        self.partitions
            .get(partition_id as usize)
            .cloned()
            .ok_or(Error::PartitionNotFound(partition_id))
    }

    /// Partition a key hashes onto
    pub fn partition_for_key(&self, key: &[u8]) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as u32
    }

    /// Append a message, hashing its key onto a partition (keyless messages
    /// go to partition 0). Returns `(partition, offset)`.
    pub async fn append(&self, message: Message) -> Result<(u32, u64)> {
        let partition_id = message
            .key
            .as_deref()
            .map(|k| self.partition_for_key(k))
            .unwrap_or(0);
        let offset = self.partition(partition_id)?.append(message).await?;
        Ok((partition_id, offset))
    }

    /// Read from one partition
    pub async fn read(
        &self,
        partition_id: u32,
        start_offset: u64,
        max_messages: usize,
    ) -> Result<Vec<Message>> {
        self.partition(partition_id)?
            .read(start_offset, max_messages)
            .await
    }

    /// Flush every partition
    pub async fn flush(&self) -> Result<()> {
        for partition in &self.partitions {
            partition.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let config = BusConfig::in_memory();
        let topic = Topic::open(&config, "uploads.raw".to_string(), 4).unwrap();

        let mut partitions = std::collections::HashSet::new();
        for _ in 0..10 {
            let (partition, _) = topic
                .append(Message::with_key("source-42", "payload"))
                .await
                .unwrap();
            partitions.insert(partition);
        }
        assert_eq!(partitions.len(), 1);
    }

    #[tokio::test]
    async fn test_per_key_ordering() {
        let config = BusConfig::in_memory();
        let topic = Topic::open(&config, "rows".to_string(), 2).unwrap();

        for i in 0..5 {
            topic
                .append(Message::with_key("source-a", format!("{}", i)))
                .await
                .unwrap();
        }

        let partition = topic.partition_for_key(b"source-a");
        let messages = topic.read(partition, 0, 10).await.unwrap();
        let values: Vec<_> = messages.iter().map(|m| m.value.clone()).collect();
        assert_eq!(values, vec![b"0", b"1", b"2", b"3", b"4"]);
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let config = BusConfig::in_memory();
        assert!(Topic::open(&config, "bad".to_string(), 0).is_err());
    }
}
