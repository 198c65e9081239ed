//! Storage backends for the metadata registry
//!
//! The registry is the only durable cross-stage state in the pipeline, so
//! its storage seam is explicit. The in-memory backend serves tests and
//! single-process deployments; the trait is where a database-backed
//! implementation would plug in.

mod memory;

pub use memory::MemoryStorage;

use crate::error::RegistryResult;
use crate::types::{SchemaVersion, Source, SourceId, SourceStatus, TableMapping};
use async_trait::async_trait;
use std::sync::Arc;

/// Storage backend trait for registry persistence.
///
/// `cas_latest_version` is the single point of serialization: it atomically
/// moves a source's version pointer from `expected` to the proposed version,
/// failing (not blocking) when another writer got there first. Everything
/// else is plain reads and writes.
#[async_trait]
pub trait RegistryStorage: Send + Sync {
    async fn insert_source(&self, source: Source) -> RegistryResult<()>;

    async fn get_source(&self, id: SourceId) -> RegistryResult<Option<Source>>;

    async fn find_source_by_name(&self, name: &str) -> RegistryResult<Option<Source>>;

    async fn list_sources(&self) -> RegistryResult<Vec<Source>>;

    /// Current version pointer for a source
    async fn latest_version(&self, id: SourceId) -> RegistryResult<Option<u32>>;

    async fn get_schema(&self, id: SourceId, version: u32) -> RegistryResult<Option<SchemaVersion>>;

    /// Atomically store `schema` and advance the version pointer, but only
    /// if the pointer still equals `expected`. Returns whether the swap won.
    async fn cas_latest_version(
        &self,
        id: SourceId,
        expected: Option<u32>,
        schema: SchemaVersion,
    ) -> RegistryResult<bool>;

    async fn get_mapping(&self, id: SourceId) -> RegistryResult<Option<TableMapping>>;

    async fn set_mapping(&self, mapping: TableMapping) -> RegistryResult<()>;

    async fn get_status(&self, id: SourceId) -> RegistryResult<SourceStatus>;

    async fn set_status(&self, id: SourceId, status: SourceStatus) -> RegistryResult<()>;

    /// Next value of the source's durable monotonic sequence counter
    async fn next_sequence(&self, id: SourceId) -> RegistryResult<u64>;
}

/// Type alias for a shared storage backend
pub type Storage = Arc<dyn RegistryStorage>;
