use crate::consumer::Consumer;
use crate::group::GroupCoordinator;
use crate::offsets::OffsetStore;
use crate::topic::Topic;
use crate::{BusConfig, Error, Message, Result};
use dashmap::DashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// The embedded message bus.
///
/// Groups related events into named topics, hashes publish keys onto
/// partitions for per-key ordering, and tracks committed offsets per consumer
/// group. Durability lives entirely here; stages stay stateless between
/// messages.
///
/// Every operation fails fast with a retryable [`Error::Unavailable`] once
/// the bus has been closed; callers are expected to back off and retry
/// rather than block.
pub struct MessageBus {
    config: BusConfig,
    topics: DashMap<String, Arc<Topic>>,
    offsets: Arc<OffsetStore>,
    coordinator: Arc<GroupCoordinator>,
    closed: Arc<AtomicBool>,
}

impl MessageBus {
    /// Open the bus, creating the data directory for durable configurations
    /// and recovering any persisted topics and committed offsets.
    pub fn open(config: BusConfig) -> Result<Self> {
        if let Some(dir) = &config.data_dir {
            fs::create_dir_all(dir)?;
        }

        let offsets = Arc::new(OffsetStore::open(config.data_dir.as_deref())?);
        let bus = Self {
            config,
            topics: DashMap::new(),
            offsets,
            coordinator: Arc::new(GroupCoordinator::new()),
            closed: Arc::new(AtomicBool::new(false)),
        };
        bus.recover_topics()?;
        Ok(bus)
    }

    /// Re-open any topic directories found under the data dir
    fn recover_topics(&self) -> Result<()> {
        let Some(dir) = &self.config.data_dir else {
            return Ok(());
        };
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let partitions = fs::read_dir(entry.path())?
                .filter_map(|p| p.ok())
                .filter(|p| p.path().extension().is_some_and(|ext| ext == "log"))
                .count() as u32;
            if partitions > 0 {
                info!(topic = %name, partitions, "Recovered topic");
                let topic = Topic::open(&self.config, name.clone(), partitions)?;
                self.topics.insert(name, Arc::new(topic));
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::unavailable("bus is closed"));
        }
        Ok(())
    }

    /// Create a topic. `partitions` defaults to the configured partition
    /// count. Creating an existing topic is an error; use
    /// [`MessageBus::get_or_create_topic`] for idempotent setup.
    pub fn create_topic(&self, name: &str, partitions: Option<u32>) -> Result<Arc<Topic>> {
        self.ensure_open()?;
        // The entry guard serializes concurrent creators of the same topic,
        // so segment files are only ever opened once.
        match self.topics.entry(name.to_string()) {
            dashmap::Entry::Occupied(_) => {
                Err(Error::Other(format!("Topic '{}' already exists", name)))
            }
            dashmap::Entry::Vacant(entry) => {
                let partitions = partitions.unwrap_or(self.config.default_partitions);
                let topic = Arc::new(Topic::open(&self.config, name.to_string(), partitions)?);
                entry.insert(topic.clone());
                Ok(topic)
            }
        }
    }

    /// Get a topic, creating it with the default partition count if absent
    pub fn get_or_create_topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.ensure_open()?;
        if let Some(topic) = self.topics.get(name) {
            return Ok(topic.clone());
        }
        match self.create_topic(name, None) {
            Ok(topic) => Ok(topic),
            // Lost a creation race: the other creator's topic is fine
            Err(Error::Other(_)) => self.get_topic(name),
            Err(e) => Err(e),
        }
    }

    pub fn topic_exists(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn get_topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topics
            .get(name)
            .map(|topic| topic.clone())
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Append a message to the partition selected by hashing `key`.
    /// Returns `(partition, offset)`.
    pub async fn publish(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<(u32, u64)> {
        self.ensure_open()?;
        let topic = self.get_or_create_topic(topic)?;
        let message = match key {
            Some(key) => Message::with_key(key, value),
            None => Message::new(value),
        };
        topic.append(message).await
    }

    /// Subscribe a new consumer-group member to a topic.
    ///
    /// The returned consumer replays from the group's last committed offset
    /// on each owned partition.
    pub fn subscribe(&self, topic: &str, group: &str) -> Result<Consumer> {
        self.ensure_open()?;
        let topic = self.get_or_create_topic(topic)?;
        let member = self.coordinator.join(topic.name(), group);
        Ok(Consumer::new(
            topic,
            group.to_string(),
            member,
            self.offsets.clone(),
            self.coordinator.clone(),
            self.closed.clone(),
        ))
    }

    /// Durably record a group's progress on a partition. Exposed for
    /// operational tooling; stage code commits through its [`Consumer`].
    pub fn commit_offset(&self, group: &str, topic: &str, partition: u32, offset: u64) -> Result<()> {
        self.ensure_open()?;
        self.offsets.commit(group, topic, partition, offset)
    }

    /// Committed offset for a group, if any
    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.offsets.fetch(group, topic, partition)
    }

    /// Flush every topic to stable storage
    pub async fn flush_all(&self) -> Result<()> {
        for entry in self.topics.iter() {
            entry.value().flush().await?;
        }
        Ok(())
    }

    /// Close the bus. In-flight and subsequent operations fail fast with a
    /// retryable error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        info!("Message bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
