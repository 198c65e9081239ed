//! Stage runner - the per-message state machine
//!
//! Drives one consuming stage: poll, decode, process, then exactly one of
//!
//! `received → processing → { committed | retried | dead-lettered }`
//!
//! - transient errors are retried in place with bounded exponential backoff;
//!   exhaustion re-queues the message (seek back, uncommitted) instead of
//!   crashing the process
//! - permanent errors publish a needs-review event to the dead-letter topic
//!   and then commit, so the poisoned message never blocks the partition
//! - schema conflicts park the partition: nothing is committed and the
//!   partition is re-checked on a slow cadence until the review resolves
//!
//! A batch message is atomic: either its side effects land and the offset is
//! committed, or neither happens and the whole message is reprocessed.

use crate::bus_client::SharedBusClient;
use crate::config::GlobalSettings;
use crate::error::{PipelineError, StageError, StageResult, StageStatus};
use crate::events::{PipelineEvent, PipelineMessage};
use crate::health::SharedHealthState;
use crate::retry::retry;
use async_trait::async_trait;
use silo_bus::{Consumer, ConsumerRecord};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Outcome of successfully handling one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Side effects fully applied; commit the offset
    Committed,
    /// Schema conflict: freeze this partition, do not commit
    Parked,
}

/// A consuming pipeline stage
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name for logs, health and dead-letter attribution
    fn name(&self) -> &'static str;

    /// Handle one message. Side effects must be fully applied before
    /// returning [`Outcome::Committed`].
    async fn process(&self, message: &PipelineMessage) -> StageResult<Outcome>;
}

/// Drives a [`Stage`] against its topic/consumer group
pub struct StageRunner {
    stage: Box<dyn Stage>,
    bus: SharedBusClient,
    topic: String,
    group: String,
    dead_letter_topic: String,
    settings: GlobalSettings,
    status: RwLock<StageStatus>,
    messages_processed: AtomicU64,
    errors_count: AtomicU64,
    health: Option<SharedHealthState>,
}

impl StageRunner {
    pub fn new(
        stage: Box<dyn Stage>,
        bus: SharedBusClient,
        topic: impl Into<String>,
        group: impl Into<String>,
        dead_letter_topic: impl Into<String>,
        settings: GlobalSettings,
    ) -> Self {
        Self {
            stage,
            bus,
            topic: topic.into(),
            group: group.into(),
            dead_letter_topic: dead_letter_topic.into(),
            settings,
            status: RwLock::new(StageStatus::Starting),
            messages_processed: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
            health: None,
        }
    }

    /// Report counters and status into a shared health state
    pub fn with_health(mut self, health: SharedHealthState) -> Self {
        self.health = Some(health);
        self
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    pub fn errors_count(&self) -> u64 {
        self.errors_count.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> StageStatus {
        *self.status.read().await
    }

    async fn set_status(&self, status: StageStatus) {
        *self.status.write().await = status;
        self.sync_health(None).await;
    }

    async fn sync_health(&self, last_error: Option<String>) {
        let Some(health) = &self.health else { return };
        let mut state = health.write().await;
        let entry = state
            .stages
            .entry(self.stage.name().to_string())
            .or_insert_with(crate::health::StageHealth::starting);
        entry.status = *self.status.read().await;
        entry.messages_processed = self.messages_processed();
        entry.errors_count = self.errors_count();
        if last_error.is_some() {
            entry.last_error = last_error;
        }
    }

    /// Run until shutdown. Returns an error only for unrecoverable runtime
    /// failures (the bus permanently gone); everything message-scoped is
    /// absorbed by the state machine.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), PipelineError> {
        info!(
            stage = self.stage.name(),
            topic = %self.topic,
            group = %self.group,
            "Stage starting"
        );

        let retry_config = self.settings.retry.to_retry_config();
        let mut consumer = retry(&retry_config, || async {
            self.bus.subscribe(&self.topic, &self.group).await
        })
        .await
        .map_err(|e| PipelineError::stage(self.stage.name(), e.to_string()))?;

        self.set_status(StageStatus::Running).await;

        // Partitions frozen on a schema conflict, with their next probe time
        let mut parked: HashMap<u32, Instant> = HashMap::new();

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(stage = self.stage.name(), "Stage shutting down");
                self.set_status(StageStatus::Stopped).await;
                return Ok(());
            }

            let records = match consumer.poll(self.settings.batch_size).await {
                Ok(records) => records,
                Err(e) if e.is_retryable() => {
                    self.set_status(StageStatus::Unhealthy).await;
                    self.bus.mark_unhealthy().await;
                    warn!(stage = self.stage.name(), error = %e, "Poll failed, backing off");
                    tokio::time::sleep(retry_config.delay_for_attempt(1)).await;
                    continue;
                }
                Err(e) => {
                    self.set_status(StageStatus::Failed).await;
                    return Err(PipelineError::stage(self.stage.name(), e.to_string()));
                }
            };

            if records.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(stage = self.stage.name(), "Stage shutting down");
                        self.set_status(StageStatus::Stopped).await;
                        return Ok(());
                    }
                    _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                }
                continue;
            }

            self.set_status(StageStatus::Running).await;

            // Partitions to skip for the remainder of this poll: parked, or
            // rewound after an exhausted retry. The consumer position was
            // already rewound, so later records from them are stale.
            let mut skip: HashSet<u32> = HashSet::new();
            let mut made_progress = false;

            for record in records {
                if skip.contains(&record.partition) {
                    continue;
                }

                // A parked partition is only probed again after the delay
                if let Some(due) = parked.get(&record.partition) {
                    if Instant::now() < *due {
                        consumer.seek(record.partition, record.offset);
                        skip.insert(record.partition);
                        continue;
                    }
                    parked.remove(&record.partition);
                }

                match self.handle_record(&mut consumer, &record, &retry_config).await {
                    RecordDisposition::Committed => {
                        made_progress = true;
                        self.messages_processed.fetch_add(1, Ordering::Relaxed);
                        self.sync_health(None).await;
                    }
                    RecordDisposition::Parked => {
                        parked.insert(
                            record.partition,
                            Instant::now() + self.settings.park_retry(),
                        );
                        skip.insert(record.partition);
                    }
                    RecordDisposition::Requeued(reason) => {
                        self.errors_count.fetch_add(1, Ordering::Relaxed);
                        self.set_status(StageStatus::Unhealthy).await;
                        self.sync_health(Some(reason)).await;
                        skip.insert(record.partition);
                    }
                    RecordDisposition::DeadLettered(reason) => {
                        made_progress = true;
                        self.errors_count.fetch_add(1, Ordering::Relaxed);
                        self.sync_health(Some(reason)).await;
                    }
                }
            }

            // Every record was parked or re-queued: sleep instead of
            // spinning on the same uncommitted heads.
            if !made_progress {
                tokio::time::sleep(self.settings.poll_interval()).await;
            }
        }
    }

    async fn handle_record(
        &self,
        consumer: &mut Consumer,
        record: &ConsumerRecord,
        retry_config: &crate::retry::RetryConfig,
    ) -> RecordDisposition {
        let message = match PipelineMessage::decode(&record.message.value) {
            Ok(message) => message,
            Err(e) => {
                // Undecodable payloads can never succeed; dead-letter the
                // raw bytes' position and move on.
                error!(
                    stage = self.stage.name(),
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Undecodable message"
                );
                return self
                    .dead_letter(consumer, record, None, e.to_string())
                    .await;
            }
        };

        debug!(
            stage = self.stage.name(),
            source_id = %message.source_id,
            sequence = message.sequence,
            kind = message.event.kind(),
            partition = record.partition,
            offset = record.offset,
            "Processing message"
        );

        let result = retry(retry_config, || self.stage.process(&message)).await;

        match result {
            Ok(Outcome::Committed) => match consumer.commit_record(record) {
                Ok(()) => RecordDisposition::Committed,
                Err(e) => {
                    // Side effects are applied but progress is not durable;
                    // reprocessing is the at-least-once contract working as
                    // designed (downstream is idempotent).
                    warn!(stage = self.stage.name(), error = %e, "Commit failed, will reprocess");
                    consumer.seek(record.partition, record.offset);
                    RecordDisposition::Requeued(e.to_string())
                }
            },
            Ok(Outcome::Parked) => {
                info!(
                    stage = self.stage.name(),
                    source_id = %message.source_id,
                    partition = record.partition,
                    "Partition parked pending schema review"
                );
                consumer.seek(record.partition, record.offset);
                RecordDisposition::Parked
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    stage = self.stage.name(),
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Retries exhausted, re-queueing message"
                );
                consumer.seek(record.partition, record.offset);
                RecordDisposition::Requeued(e.to_string())
            }
            Err(e) => {
                error!(
                    stage = self.stage.name(),
                    source_id = %message.source_id,
                    error = %e,
                    "Permanent failure, dead-lettering"
                );
                self.dead_letter(consumer, record, Some(&message), e.to_string())
                    .await
            }
        }
    }

    /// Publish a needs-review event, then commit past the poisoned message.
    /// The message is preserved on its original topic (offsets only hide
    /// it), so nothing is silently dropped.
    async fn dead_letter(
        &self,
        consumer: &mut Consumer,
        record: &ConsumerRecord,
        message: Option<&PipelineMessage>,
        reason: String,
    ) -> RecordDisposition {
        let notice = match message {
            Some(message) => PipelineMessage::new(
                message.source_id,
                message.sequence,
                PipelineEvent::NeedsReview {
                    stage: self.stage.name().to_string(),
                    reason: reason.clone(),
                },
            ),
            None => PipelineMessage::new(
                silo_registry::SourceId::new(),
                record.offset,
                PipelineEvent::NeedsReview {
                    stage: self.stage.name().to_string(),
                    reason: format!(
                        "undecodable message at {}/{}#{}: {}",
                        record.topic, record.partition, record.offset, reason
                    ),
                },
            ),
        };

        let retry_config = self.settings.retry.to_retry_config();
        let published = retry(&retry_config, || async {
            self.bus.publish(&self.dead_letter_topic, &notice).await
        })
        .await;

        match published {
            Ok(_) => {
                if let Err(e) = consumer.commit_record(record) {
                    warn!(stage = self.stage.name(), error = %e, "Commit after dead-letter failed");
                    consumer.seek(record.partition, record.offset);
                    return RecordDisposition::Requeued(e.to_string());
                }
                RecordDisposition::DeadLettered(reason)
            }
            Err(e) => {
                // Cannot even reach the dead-letter topic: keep the message
                // on its partition and try the whole thing again later.
                warn!(stage = self.stage.name(), error = %e, "Dead-letter publish failed, re-queueing");
                consumer.seek(record.partition, record.offset);
                RecordDisposition::Requeued(e.to_string())
            }
        }
    }
}

enum RecordDisposition {
    Committed,
    Parked,
    Requeued(String),
    DeadLettered(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_client::BusClient;
    use crate::config::PipelineConfig;
    use silo_registry::SourceId;
    use std::sync::Arc;

    struct FlakyStage {
        failures_left: AtomicU64,
    }

    #[async_trait]
    impl Stage for FlakyStage {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn process(&self, _message: &PipelineMessage) -> StageResult<Outcome> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(StageError::StoreUnavailable("blip".into()))
            } else {
                Ok(Outcome::Committed)
            }
        }
    }

    struct PoisonStage;

    #[async_trait]
    impl Stage for PoisonStage {
        fn name(&self) -> &'static str {
            "poison"
        }

        async fn process(&self, _message: &PipelineMessage) -> StageResult<Outcome> {
            Err(StageError::fatal("unparseable file"))
        }
    }

    async fn test_setup(topic: &str) -> (Arc<BusClient>, PipelineConfig) {
        let mut config = PipelineConfig::default();
        config.settings.retry.max_retries = 3;
        config.settings.retry.initial_backoff_ms = 1;
        config.settings.poll_interval_ms = 5;
        let client = Arc::new(BusClient::new());
        client.connect(&config).await.unwrap();
        client
            .subscribe(topic, "bootstrap")
            .await
            .unwrap()
            .close();
        (client, config)
    }

    fn message() -> PipelineMessage {
        PipelineMessage::new(
            SourceId::new(),
            0,
            PipelineEvent::NeedsReview {
                stage: "test".into(),
                reason: "payload".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_then_committed() {
        let (bus, config) = test_setup("stage.in").await;
        bus.publish("stage.in", &message()).await.unwrap();

        let runner = StageRunner::new(
            Box::new(FlakyStage {
                failures_left: AtomicU64::new(2),
            }),
            bus.clone(),
            "stage.in",
            "flaky-group",
            config.topics.dead_letter.clone(),
            config.settings.clone(),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        // The message was committed after retries: a fresh member of the
        // same group sees nothing.
        let mut probe = bus.subscribe("stage.in", "flaky-group").await.unwrap();
        assert!(probe.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_and_advances() {
        let (bus, config) = test_setup("stage.poison").await;
        bus.publish("stage.poison", &message()).await.unwrap();

        let runner = StageRunner::new(
            Box::new(PoisonStage),
            bus.clone(),
            "stage.poison",
            "poison-group",
            config.topics.dead_letter.clone(),
            config.settings.clone(),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        // Dead-letter topic carries the needs-review event
        let mut dlq = bus
            .subscribe(&config.topics.dead_letter, "operator")
            .await
            .unwrap();
        let notices = dlq.poll(10).await.unwrap();
        assert_eq!(notices.len(), 1);
        let notice = PipelineMessage::decode(&notices[0].message.value).unwrap();
        match notice.event {
            PipelineEvent::NeedsReview { stage, .. } => assert_eq!(stage, "poison"),
            other => panic!("expected NeedsReview, got {:?}", other),
        }

        // And the poisoned message no longer blocks the partition
        let mut probe = bus.subscribe("stage.poison", "poison-group").await.unwrap();
        assert!(probe.poll(10).await.unwrap().is_empty());
    }
}
