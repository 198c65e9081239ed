//! Loader - idempotent bulk upsert into the destination store
//!
//! Consumes transformed row batches, makes sure the destination table
//! exists for the batch's columns (creating it on first load, evolving
//! add-column-only when the schema advanced), computes a deterministic row
//! identity (declared natural key, else a content hash), and upserts. The
//! bus offset is committed only after the store acknowledges, so redelivery
//! rewrites the same rows instead of duplicating them.

use crate::bus_client::SharedBusClient;
use crate::config::LoaderSettings;
use crate::error::{StageError, StageResult};
use crate::events::{PipelineEvent, PipelineMessage, RowRecord};
use crate::runner::{Outcome, Stage};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use silo_registry::{ColumnDef, MetadataRegistry, SourceId};
use silo_store::{AnalyticStore, CellValue, KeyedRow};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Loader {
    registry: Arc<MetadataRegistry>,
    store: Arc<dyn AnalyticStore>,
    settings: LoaderSettings,
}

impl Loader {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        store: Arc<dyn AnalyticStore>,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    /// Destination table for a source: the registered mapping if one
    /// exists, else prefix + sanitized source name.
    async fn table_for(&self, source_id: SourceId, source_name: &str) -> StageResult<String> {
        if let Some(mapping) = self.registry.get_mapping(source_id).await? {
            return Ok(mapping.table_name);
        }
        let sanitized: String = source_name
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Ok(format!("{}{}", self.settings.table_prefix, sanitized))
    }

    /// Deterministic row identity: source id + declared natural key values,
    /// else source id + content hash over the canonical row.
    fn row_identity(
        &self,
        source_id: SourceId,
        source_name: &str,
        columns: &[ColumnDef],
        row: &RowRecord,
    ) -> String {
        if let Some(key_columns) = self.settings.natural_keys.get(source_name) {
            let mut parts = Vec::with_capacity(key_columns.len());
            let mut resolved = true;
            for key in key_columns {
                match columns.iter().position(|c| &c.name == key) {
                    Some(position) => parts.push(row.values[position].canonical()),
                    None => {
                        warn!(
                            source_name,
                            key, "Natural-key column missing from batch, hashing content instead"
                        );
                        resolved = false;
                        break;
                    }
                }
            }
            if resolved {
                return format!("{}:{}", source_id, parts.join("\u{1f}"));
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(source_id.to_string().as_bytes());
        for (column, value) in columns.iter().zip(&row.values) {
            hasher.update(column.name.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.canonical().as_bytes());
            hasher.update([0x1e]);
        }
        format!("{}:{}", source_id, hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl Stage for Loader {
    fn name(&self) -> &'static str {
        "loader"
    }

    async fn process(&self, message: &PipelineMessage) -> StageResult<Outcome> {
        let PipelineEvent::TransformedBatch { columns, rows } = &message.event else {
            return Err(StageError::fatal(format!(
                "unexpected event '{}' on transformed topic",
                message.event.kind()
            )));
        };
        let version = message
            .schema_version
            .ok_or_else(|| StageError::fatal("transformed batch without a schema version"))?;

        let source = self.registry.get_source(message.source_id).await?;
        let table = self.table_for(message.source_id, &source.name).await?;

        self.store.ensure_table(&table, columns).await?;

        // First load binds the mapping; later loads advance it only when
        // the version moved forward.
        match self.registry.get_mapping(message.source_id).await? {
            None => {
                self.registry
                    .set_mapping(message.source_id, &table, version)
                    .await?;
            }
            Some(mapping) if version > mapping.schema_version => {
                self.registry
                    .set_mapping(message.source_id, &table, version)
                    .await?;
            }
            Some(_) => {}
        }

        let keyed: Vec<KeyedRow> = rows
            .iter()
            .map(|row| {
                let identity =
                    self.row_identity(message.source_id, &source.name, columns, row);
                let values: HashMap<String, CellValue> = columns
                    .iter()
                    .zip(&row.values)
                    .map(|(c, v)| (c.name.clone(), v.clone()))
                    .collect();
                KeyedRow::new(identity, values)
            })
            .collect();

        let result = self.store.upsert_rows(&table, keyed).await?;
        info!(
            source_id = %message.source_id,
            table,
            sequence = message.sequence,
            inserted = result.rows_inserted,
            updated = result.rows_updated,
            "Batch loaded"
        );
        Ok(Outcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_client::BusClient;
    use crate::config::PipelineConfig;
    use silo_registry::{ColumnType, SchemaProposal};
    use silo_store::MemoryStore;

    async fn loader_setup(
        settings: LoaderSettings,
    ) -> (Loader, Arc<MetadataRegistry>, Arc<MemoryStore>) {
        let registry = Arc::new(MetadataRegistry::in_memory());
        let store = Arc::new(MemoryStore::new());
        let loader = Loader::new(registry.clone(), store.clone(), settings);
        (loader, registry, store)
    }

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("year", ColumnType::Integer),
            ColumnDef::required("revenue", ColumnType::Integer),
        ]
    }

    async fn registered_source(registry: &MetadataRegistry) -> (SourceId, u32) {
        let source = registry.ensure_source("enrollment").await.unwrap();
        let proposal = registry.propose_schema(source.id, columns()).await.unwrap();
        let version = match proposal {
            SchemaProposal::Evolved(v) | SchemaProposal::Unchanged(v) => v.version,
            SchemaProposal::Conflict(c) => panic!("unexpected conflict: {}", c),
        };
        (source.id, version)
    }

    fn batch(source_id: SourceId, version: u32, rows: Vec<RowRecord>) -> PipelineMessage {
        PipelineMessage::new(
            source_id,
            0,
            PipelineEvent::TransformedBatch {
                columns: columns(),
                rows,
            },
        )
        .with_schema_version(version)
    }

    fn row(year: i64, revenue: i64) -> RowRecord {
        RowRecord::new(vec![CellValue::Integer(year), CellValue::Integer(revenue)])
    }

    #[tokio::test]
    async fn test_first_load_creates_table_and_mapping() {
        let (loader, registry, store) = loader_setup(LoaderSettings::default()).await;
        let (source_id, version) = registered_source(&registry).await;

        let message = batch(source_id, version, vec![row(2020, 100_000), row(2021, 150_000)]);
        assert_eq!(loader.process(&message).await.unwrap(), Outcome::Committed);

        assert_eq!(store.row_count("src_enrollment").await.unwrap(), 2);
        let mapping = registry.get_mapping(source_id).await.unwrap().unwrap();
        assert_eq!(mapping.table_name, "src_enrollment");
        assert_eq!(mapping.schema_version, version);
    }

    #[tokio::test]
    async fn test_redelivery_does_not_duplicate() {
        let (loader, registry, store) = loader_setup(LoaderSettings::default()).await;
        let (source_id, version) = registered_source(&registry).await;

        let message = batch(source_id, version, vec![row(2020, 100_000), row(2021, 150_000)]);
        loader.process(&message).await.unwrap();
        loader.process(&message).await.unwrap();

        assert_eq!(store.row_count("src_enrollment").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_natural_key_updates_in_place() {
        let settings = LoaderSettings {
            natural_keys: HashMap::from([(
                "enrollment".to_string(),
                vec!["year".to_string()],
            )]),
            ..Default::default()
        };
        let (loader, registry, store) = loader_setup(settings).await;
        let (source_id, version) = registered_source(&registry).await;

        loader
            .process(&batch(source_id, version, vec![row(2020, 100_000)]))
            .await
            .unwrap();
        // Same natural key, revised revenue: the row is rewritten, not added
        loader
            .process(&batch(source_id, version, vec![row(2020, 120_000)]))
            .await
            .unwrap();

        assert_eq!(store.row_count("src_enrollment").await.unwrap(), 1);
        let rows = store.scan("src_enrollment").await.unwrap();
        assert_eq!(rows[0]["revenue"], CellValue::Integer(120_000));
    }

    #[tokio::test]
    async fn test_unavailable_store_is_retryable() {
        let (loader, registry, store) = loader_setup(LoaderSettings::default()).await;
        let (source_id, version) = registered_source(&registry).await;
        store.close();

        let err = loader
            .process(&batch(source_id, version, vec![row(2020, 1)]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_version_advance_evolves_table() {
        let (loader, registry, store) = loader_setup(LoaderSettings::default()).await;
        let (source_id, v1) = registered_source(&registry).await;
        loader
            .process(&batch(source_id, v1, vec![row(2020, 100_000)]))
            .await
            .unwrap();

        // Schema evolves with a nullable column
        let mut extended = columns();
        extended.push(ColumnDef::nullable("region", ColumnType::Text));
        let v2 = match registry.propose_schema(source_id, extended.clone()).await.unwrap() {
            SchemaProposal::Evolved(v) => v.version,
            other => panic!("expected Evolved, got {:?}", other),
        };

        let message = PipelineMessage::new(
            source_id,
            1,
            PipelineEvent::TransformedBatch {
                columns: extended,
                rows: vec![RowRecord::new(vec![
                    CellValue::Integer(2021),
                    CellValue::Integer(150_000),
                    CellValue::Text("west".into()),
                ])],
            },
        )
        .with_schema_version(v2);
        loader.process(&message).await.unwrap();

        // Old row reads null for the new column; mapping advanced
        let rows = store.scan("src_enrollment").await.unwrap();
        assert_eq!(rows[0]["region"], CellValue::Null);
        assert_eq!(rows[1]["region"], CellValue::Text("west".into()));
        let mapping = registry.get_mapping(source_id).await.unwrap().unwrap();
        assert_eq!(mapping.schema_version, v2);
    }
}
