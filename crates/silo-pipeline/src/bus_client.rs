//! Bus client with startup-attach support
//!
//! A resilient wrapper around [`silo_bus::MessageBus`] that gives every
//! stage the same attachment discipline: bounded attach retries at startup
//! (fatal on exhaustion), status tracking for health checks, and fail-fast
//! errors (never hangs) once the bus is gone.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError, StageResult, StageStatus};
use crate::events::PipelineMessage;
use crate::retry::attach;
use silo_bus::{BusConfig, Consumer, MessageBus};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Shared bus client handed to every stage in the process
pub type SharedBusClient = Arc<BusClient>;

/// Resilient bus client
pub struct BusClient {
    bus: RwLock<Option<Arc<MessageBus>>>,
    status: RwLock<StageStatus>,
}

impl BusClient {
    /// Create a detached client; call [`BusClient::connect`] before use
    pub fn new() -> Self {
        Self {
            bus: RwLock::new(None),
            status: RwLock::new(StageStatus::Starting),
        }
    }

    /// Wrap an already-open bus (tests, single-process deployments where
    /// every stage shares one embedded bus).
    pub fn with_bus(bus: Arc<MessageBus>) -> Self {
        Self {
            bus: RwLock::new(Some(bus)),
            status: RwLock::new(StageStatus::Running),
        }
    }

    /// Attach to the bus with the configured startup policy and make sure
    /// every pipeline topic exists. Exhausting the attempts is fatal for
    /// the process.
    pub async fn connect(&self, config: &PipelineConfig) -> Result<(), PipelineError> {
        let attach_config = config.settings.startup.to_attach_config();
        let bus_config: BusConfig = config.bus.clone();

        let bus = attach("bus", &attach_config, || {
            let bus_config = bus_config.clone();
            async move { MessageBus::open(bus_config).map(Arc::new) }
        })
        .await?;

        for topic in config.topics.all() {
            bus.get_or_create_topic(topic)
                .map_err(|e| PipelineError::config(format!("topic '{}': {}", topic, e)))?;
        }

        info!(topics = ?config.topics.all(), "Attached to message bus");
        *self.bus.write().await = Some(bus);
        *self.status.write().await = StageStatus::Running;
        Ok(())
    }

    /// Current connection status
    pub async fn status(&self) -> StageStatus {
        *self.status.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.bus
            .read()
            .await
            .as_ref()
            .is_some_and(|bus| !bus.is_closed())
    }

    async fn handle(&self) -> StageResult<Arc<MessageBus>> {
        let guard = self.bus.read().await;
        match guard.as_ref() {
            Some(bus) if !bus.is_closed() => Ok(bus.clone()),
            _ => Err(StageError::BusUnavailable("not connected".to_string())),
        }
    }

    /// Publish a pipeline message keyed by its source identifier
    pub async fn publish(&self, topic: &str, message: &PipelineMessage) -> StageResult<(u32, u64)> {
        let bus = self.handle().await?;
        let payload = message.encode()?;
        let position = bus.publish(topic, Some(message.key()), payload).await?;
        Ok(position)
    }

    /// Subscribe a consumer-group member to a topic
    pub async fn subscribe(&self, topic: &str, group: &str) -> StageResult<Consumer> {
        let bus = self.handle().await?;
        Ok(bus.subscribe(topic, group)?)
    }

    /// Mark the client unhealthy (a stage observed a bus failure)
    pub async fn mark_unhealthy(&self) {
        *self.status.write().await = StageStatus::Unhealthy;
    }
}

impl Default for BusClient {
    fn default() -> Self {
        Self::new()
    }
}
