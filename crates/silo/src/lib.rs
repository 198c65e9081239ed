//! # Silo
//!
//! Tabular ingestion pipeline: uploads are detected, extracted, transformed
//! and loaded into a columnar analytical store through a durable message
//! bus, with a shared schema/metadata registry holding the only durable
//! cross-stage state.
//!
//! This crate is a unified API for the Silo ecosystem, re-exporting the
//! commonly used types from [`silo_bus`], [`silo_registry`], [`silo_store`]
//! and [`silo_pipeline`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use silo::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::default();
//!
//!     let bus: SharedBusClient = Arc::new(BusClient::new());
//!     bus.connect(&config).await?;
//!     let registry = Arc::new(MetadataRegistry::in_memory());
//!
//!     let connector = Connector::new(
//!         bus,
//!         registry,
//!         config.connector.clone(),
//!         config.topics.raw.clone(),
//!     );
//!     let receipt = connector
//!         .accept_upload("enrollment", "fy.csv", b"year,revenue\n2020,100000\n")
//!         .await?;
//!     println!("accepted upload for source {}", receipt.source_id);
//!
//!     Ok(())
//! }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

// Re-export the component crates under short names
pub use silo_bus as bus;
pub use silo_pipeline as pipeline;
pub use silo_registry as registry;
pub use silo_store as store;

/// Prelude module for convenient imports.
///
/// ```rust
/// use silo::prelude::*;
/// ```
pub mod prelude {
    pub use silo_pipeline::prelude::*;

    pub use silo_bus::{Consumer, ConsumerRecord, Message};
    pub use silo_registry::{
        SchemaConflict, SchemaVersion, Source, SourceStatus, TableMapping,
    };
    pub use silo_store::{ColumnarTable, WriteResult};
}
