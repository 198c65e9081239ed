//! Metadata registry - main interface
//!
//! The registry holds all durable cross-stage state: sources, their
//! versioned column schemas, destination table mappings, review status, and
//! the per-source sequence counter. Mutations for one source are serialized
//! through a compare-and-set on the stored version pointer; different
//! sources never contend.

use crate::compatibility::{diff, SchemaConflict, SchemaDiff};
use crate::error::{RegistryError, RegistryResult};
use crate::storage::{MemoryStorage, Storage};
use crate::types::{
    validate_columns, ColumnDef, SchemaVersion, Source, SourceId, SourceStatus, TableMapping,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a schema proposal
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaProposal {
    /// Proposal matches the current version; nothing was created
    Unchanged(SchemaVersion),
    /// A new version was created (nullable additions only)
    Evolved(SchemaVersion),
    /// Incompatible; no version was created and the source is frozen
    Conflict(SchemaConflict),
}

impl SchemaProposal {
    /// The authoritative schema after the proposal, if the source advanced
    /// or stayed put.
    pub fn resolved(&self) -> Option<&SchemaVersion> {
        match self {
            SchemaProposal::Unchanged(v) | SchemaProposal::Evolved(v) => Some(v),
            SchemaProposal::Conflict(_) => None,
        }
    }
}

/// Schema/metadata registry shared by the Detector, Transformer and Loader.
pub struct MetadataRegistry {
    storage: Storage,
}

impl MetadataRegistry {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// In-memory registry for tests and single-process deployments
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    // ========================================================================
    // Sources
    // ========================================================================

    /// Create a source. Fails if the name is already taken.
    pub async fn create_source(&self, name: &str) -> RegistryResult<Source> {
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidInput("empty source name".into()));
        }
        if self.storage.find_source_by_name(name).await?.is_some() {
            return Err(RegistryError::AlreadyExists(format!("Source '{}'", name)));
        }
        let source = Source::new(name);
        self.storage.insert_source(source.clone()).await?;
        info!(source_id = %source.id, name, "Created source");
        Ok(source)
    }

    /// Resolve a source by name, creating it on first sight.
    ///
    /// This is what gives repeated uploads under the same name a shared
    /// schema history.
    pub async fn ensure_source(&self, name: &str) -> RegistryResult<Source> {
        if let Some(existing) = self.storage.find_source_by_name(name).await? {
            return Ok(existing);
        }
        self.create_source(name).await
    }

    pub async fn get_source(&self, id: SourceId) -> RegistryResult<Source> {
        self.storage
            .get_source(id)
            .await?
            .ok_or_else(|| RegistryError::SourceNotFound(id.to_string()))
    }

    pub async fn list_sources(&self) -> RegistryResult<Vec<Source>> {
        self.storage.list_sources().await
    }

    // ========================================================================
    // Schemas
    // ========================================================================

    /// Current schema version for a source, or `None` before first detection
    pub async fn get_latest_schema(&self, id: SourceId) -> RegistryResult<Option<SchemaVersion>> {
        match self.storage.latest_version(id).await? {
            Some(version) => self.storage.get_schema(id, version).await,
            None => Ok(None),
        }
    }

    pub async fn get_schema(&self, id: SourceId, version: u32) -> RegistryResult<SchemaVersion> {
        self.storage
            .get_schema(id, version)
            .await?
            .ok_or_else(|| RegistryError::VersionNotFound {
                source_id: id.to_string(),
                version,
            })
    }

    /// Propose an inferred column list for a source.
    ///
    /// Identical → current version, unchanged. Pure addition of nullable
    /// columns → a new version whose column list is the current one with the
    /// additions appended (existing column order is preserved so the
    /// destination table stays stable). Anything else → [`SchemaProposal::Conflict`]:
    /// no version is created and the source is marked needs-review.
    ///
    /// Lost CAS races are retried against the fresh pointer, so two
    /// detectors proposing concurrently converge instead of clobbering each
    /// other.
    pub async fn propose_schema(
        &self,
        id: SourceId,
        columns: Vec<ColumnDef>,
    ) -> RegistryResult<SchemaProposal> {
        validate_columns(&columns)?;
        self.get_source(id).await?;

        if self.storage.get_status(id).await? == SourceStatus::NeedsReview {
            let current_version = self.storage.latest_version(id).await?.unwrap_or(0);
            return Ok(SchemaProposal::Conflict(SchemaConflict {
                current_version,
                reasons: vec!["source is frozen pending schema review".to_string()],
                already_frozen: true,
            }));
        }

        loop {
            let current = self.get_latest_schema(id).await?;

            let (expected, next) = match &current {
                None => {
                    // First sight: the proposal becomes version 1 as-is
                    (None, SchemaVersion::new(id, 1, columns.clone()))
                }
                Some(current) => match diff(&current.columns, &columns) {
                    SchemaDiff::Identical => {
                        return Ok(SchemaProposal::Unchanged(current.clone()));
                    }
                    SchemaDiff::AddsNullable(added) => {
                        let mut merged = current.columns.clone();
                        merged.extend(added);
                        (
                            Some(current.version),
                            SchemaVersion::new(id, current.version + 1, merged),
                        )
                    }
                    SchemaDiff::Breaking(reasons) => {
                        warn!(
                            source_id = %id,
                            current_version = current.version,
                            ?reasons,
                            "Schema conflict, freezing source for review"
                        );
                        self.storage.set_status(id, SourceStatus::NeedsReview).await?;
                        return Ok(SchemaProposal::Conflict(SchemaConflict {
                            current_version: current.version,
                            reasons,
                            already_frozen: false,
                        }));
                    }
                },
            };

            if self
                .storage
                .cas_latest_version(id, expected, next.clone())
                .await?
            {
                info!(
                    source_id = %id,
                    version = next.version,
                    columns = next.columns.len(),
                    "Registered schema version"
                );
                return Ok(SchemaProposal::Evolved(next));
            }
            // Lost the race; re-read and re-diff against the winner
        }
    }

    // ========================================================================
    // Mappings
    // ========================================================================

    pub async fn get_mapping(&self, id: SourceId) -> RegistryResult<Option<TableMapping>> {
        self.storage.get_mapping(id).await
    }

    /// Bind (or advance) the destination table mapping for a source.
    ///
    /// One active mapping per source: the table name is fixed on first load
    /// and the schema version may only move forward.
    pub async fn set_mapping(
        &self,
        id: SourceId,
        table_name: &str,
        schema_version: u32,
    ) -> RegistryResult<TableMapping> {
        self.get_schema(id, schema_version).await?;

        if let Some(existing) = self.storage.get_mapping(id).await? {
            if existing.table_name != table_name {
                return Err(RegistryError::MappingConflict {
                    source_id: id.to_string(),
                    reason: format!(
                        "mapped to table '{}', refusing rebind to '{}'",
                        existing.table_name, table_name
                    ),
                });
            }
            if schema_version < existing.schema_version {
                return Err(RegistryError::MappingConflict {
                    source_id: id.to_string(),
                    reason: format!(
                        "mapping at version {} cannot rewind to {}",
                        existing.schema_version, schema_version
                    ),
                });
            }
        }

        let mapping = TableMapping::new(id, table_name, schema_version);
        self.storage.set_mapping(mapping.clone()).await?;
        info!(source_id = %id, table_name, schema_version, "Set table mapping");
        Ok(mapping)
    }

    // ========================================================================
    // Status & sequences
    // ========================================================================

    pub async fn status(&self, id: SourceId) -> RegistryResult<SourceStatus> {
        self.storage.get_status(id).await
    }

    pub async fn mark_needs_review(&self, id: SourceId) -> RegistryResult<()> {
        self.storage.set_status(id, SourceStatus::NeedsReview).await
    }

    /// Operator action: unfreeze a source after resolving a conflict
    pub async fn resolve_review(&self, id: SourceId) -> RegistryResult<()> {
        self.storage.set_status(id, SourceStatus::Active).await?;
        info!(source_id = %id, "Source review resolved");
        Ok(())
    }

    /// Reserve the next value of the source's monotonic sequence counter.
    /// Used by the Extractor to number row batches durably.
    pub async fn next_sequence(&self, id: SourceId) -> RegistryResult<u64> {
        self.storage.next_sequence(id).await
    }
}
