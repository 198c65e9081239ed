//! silo-pipeline - stage SDK, runtime and the five ingestion stages
//!
//! # Architecture
//!
//! Uploads flow through five independently-deployed stages, decoupled by
//! durable bus topics; the registry is the only durable cross-stage state.
//!
//! ```text
//! upload ──▶ Connector ──uploads.raw──▶ Detector ──schema.resolved──▶ Extractor
//!                             │              │                            │
//!                             ▼              ▼                      rows.extracted
//!                        raw storage   ┌──────────┐                       │
//!                                      │ Registry │                       ▼
//!                                      └──────────┘                  Transformer
//!                                        ▲      ▲                         │
//!                                        │      │                  rows.transformed
//!                                        │      │                         │
//!                                        │      └───────── Loader ◀───────┘
//!                                        │                    │
//!                                        │                    ▼
//!                                        └──────────── columnar store
//! ```
//!
//! Each consuming stage runs the same per-message state machine
//! (`received → processing → {committed | retried | dead-lettered}`), the
//! same startup-attach discipline, and commits its offset strictly after
//! side effects: at-least-once delivery with an idempotent Loader at the
//! end.

pub mod bus_client;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod retry;
pub mod runner;
pub mod stages;

// Re-export the SDK surface at the crate root for ergonomic use
pub use bus_client::{BusClient, SharedBusClient};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result, StageError, StageResult, StageStatus};
pub use events::{PipelineEvent, PipelineMessage, RowRecord};
pub use health::{HealthState, SharedHealthState, StageHealth};
pub use retry::{attach, retry, retry_result, AttachConfig, RetryConfig};
pub use runner::{Outcome, Stage, StageRunner};
pub use stages::{
    Connector, Detector, Extractor, Loader, Transformer, TransformRule, UploadError,
    UploadReceipt,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus_client::{BusClient, SharedBusClient};
    pub use crate::config::PipelineConfig;
    pub use crate::error::{PipelineError, StageError, StageResult, StageStatus};
    pub use crate::events::{PipelineEvent, PipelineMessage, RowRecord};
    pub use crate::retry::{attach, retry, AttachConfig, RetryConfig};
    pub use crate::runner::{Outcome, Stage, StageRunner};
    pub use crate::stages::{
        Connector, Detector, Extractor, Loader, Transformer, TransformRule,
    };
    pub use silo_bus::{BusConfig, MessageBus};
    pub use silo_registry::{
        ColumnDef, ColumnType, MetadataRegistry, SchemaProposal, SourceId,
    };
    pub use silo_store::{AnalyticStore, CellValue, KeyedRow, MemoryStore};
}
