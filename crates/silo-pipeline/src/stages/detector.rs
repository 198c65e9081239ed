//! Detector - schema inference and reconciliation
//!
//! Consumes raw-batch events, samples the head of the referenced file to
//! infer a column schema, and reconciles it against the registry:
//! create-on-first-sight, compatible-extend on nullable additions, conflict
//! otherwise. On success a schema-resolved event advances the pipeline; on
//! conflict a needs-review event goes to the dead-letter topic and the
//! partition stays parked, so nothing for that source advances until an
//! operator resolves the review.

use crate::bus_client::SharedBusClient;
use crate::config::DetectorSettings;
use crate::error::{StageError, StageResult};
use crate::events::{PipelineEvent, PipelineMessage};
use crate::runner::{Outcome, Stage};
use crate::stages::inference::TypeInference;
use async_trait::async_trait;
use silo_registry::{ColumnDef, MetadataRegistry, SchemaProposal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Detector {
    bus: SharedBusClient,
    registry: Arc<MetadataRegistry>,
    settings: DetectorSettings,
    resolved_topic: String,
    dead_letter_topic: String,
}

impl Detector {
    pub fn new(
        bus: SharedBusClient,
        registry: Arc<MetadataRegistry>,
        settings: DetectorSettings,
        resolved_topic: impl Into<String>,
        dead_letter_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            registry,
            settings,
            resolved_topic: resolved_topic.into(),
            dead_letter_topic: dead_letter_topic.into(),
        }
    }

    /// Read the header plus a bounded sample of data rows and infer columns
    async fn infer_columns(&self, path: &Path) -> StageResult<Vec<ColumnDef>> {
        let path = path.to_path_buf();
        let sample_rows = self.settings.sample_rows;

        let columns = tokio::task::spawn_blocking(move || sample_file(&path, sample_rows))
            .await
            .map_err(|e| StageError::Internal(format!("sample task: {}", e)))??;
        Ok(columns)
    }
}

/// Blocking helper: csv-read the first `sample_rows` records of `path`
fn sample_file(path: &PathBuf, sample_rows: usize) -> StageResult<Vec<ColumnDef>> {
    let file = std::fs::File::open(path).map_err(|e| {
        StageError::fatal(format!("upload {} unreadable: {}", path.display(), e))
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| StageError::fatal(format!("unparseable header: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(StageError::fatal("upload has no header row"));
    }

    let mut inference = TypeInference::new(headers);
    for record in reader.records().take(sample_rows) {
        let record = record.map_err(|e| StageError::fatal(format!("unparseable sample: {}", e)))?;
        let cells: Vec<&str> = record.iter().collect();
        inference.add_record(&cells);
    }

    if inference.sample_count() == 0 {
        return Err(StageError::fatal("upload has a header but no data rows"));
    }
    Ok(inference.finalize())
}

#[async_trait]
impl Stage for Detector {
    fn name(&self) -> &'static str {
        "detector"
    }

    async fn process(&self, message: &PipelineMessage) -> StageResult<Outcome> {
        let PipelineEvent::RawBatch { upload_path, .. } = &message.event else {
            return Err(StageError::fatal(format!(
                "unexpected event '{}' on raw topic",
                message.event.kind()
            )));
        };

        let columns = self.infer_columns(upload_path).await?;
        let proposal = self
            .registry
            .propose_schema(message.source_id, columns)
            .await?;

        match proposal {
            SchemaProposal::Unchanged(schema) | SchemaProposal::Evolved(schema) => {
                info!(
                    source_id = %message.source_id,
                    version = schema.version,
                    "Schema resolved"
                );
                let resolved = PipelineMessage::new(
                    message.source_id,
                    message.sequence,
                    PipelineEvent::SchemaResolved {
                        upload_path: upload_path.clone(),
                    },
                )
                .with_schema_version(schema.version);
                self.bus.publish(&self.resolved_topic, &resolved).await?;
                Ok(Outcome::Committed)
            }
            SchemaProposal::Conflict(conflict) => {
                // The first conflict for a source goes to the dead-letter
                // topic; repeated probes of an already-frozen source stay
                // quiet so the operator sees one notice per incident.
                if conflict.already_frozen {
                    return Ok(Outcome::Parked);
                }
                warn!(
                    source_id = %message.source_id,
                    %conflict,
                    "Schema conflict, routing to dead letter"
                );
                let notice = PipelineMessage::new(
                    message.source_id,
                    message.sequence,
                    PipelineEvent::NeedsReview {
                        stage: self.name().to_string(),
                        reason: conflict.to_string(),
                    },
                );
                self.bus.publish(&self.dead_letter_topic, &notice).await?;
                // Not committed: the raw event is re-examined once the
                // review resolves, so the upload is never silently dropped.
                Ok(Outcome::Parked)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_client::BusClient;
    use crate::config::PipelineConfig;
    use chrono::Utc;
    use silo_registry::ColumnType;

    async fn detector_setup() -> (Detector, SharedBusClient, Arc<MetadataRegistry>) {
        let config = PipelineConfig::default();
        let bus = Arc::new(BusClient::new());
        bus.connect(&config).await.unwrap();
        let registry = Arc::new(MetadataRegistry::in_memory());
        let detector = Detector::new(
            bus.clone(),
            registry.clone(),
            DetectorSettings::default(),
            config.topics.resolved.clone(),
            config.topics.dead_letter.clone(),
        );
        (detector, bus, registry)
    }

    async fn raw_message(
        registry: &MetadataRegistry,
        dir: &Path,
        name: &str,
        content: &str,
    ) -> PipelineMessage {
        let source = registry.ensure_source(name).await.unwrap();
        let path = dir.join(format!("{}.csv", name));
        std::fs::write(&path, content).unwrap();
        PipelineMessage::new(
            source.id,
            0,
            PipelineEvent::RawBatch {
                source_name: name.to_string(),
                upload_path: path,
                uploaded_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn test_first_sight_registers_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, bus, registry) = detector_setup().await;
        let message = raw_message(
            &registry,
            dir.path(),
            "enrollment",
            "year,revenue,students\n2020,100000,500\n2021,150000,600\n",
        )
        .await;

        let outcome = detector.process(&message).await.unwrap();
        assert_eq!(outcome, Outcome::Committed);

        let schema = registry
            .get_latest_schema(message.source_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schema.version, 1);
        assert_eq!(
            schema.column("revenue").map(|c| c.column_type),
            Some(ColumnType::Integer)
        );

        let mut consumer = bus.subscribe("schema.resolved", "probe").await.unwrap();
        let records = consumer.poll(10).await.unwrap();
        assert_eq!(records.len(), 1);
        let resolved = PipelineMessage::decode(&records[0].message.value).unwrap();
        assert_eq!(resolved.schema_version, Some(1));
    }

    #[tokio::test]
    async fn test_conflict_parks_and_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, bus, registry) = detector_setup().await;

        let first = raw_message(
            &registry,
            dir.path(),
            "enrollment",
            "year,revenue\n2020,100000\n",
        )
        .await;
        detector.process(&first).await.unwrap();

        // Same source, revenue retyped to text
        let second = raw_message(
            &registry,
            dir.path(),
            "enrollment",
            "year,revenue\n2021,lots\n",
        )
        .await;
        let outcome = detector.process(&second).await.unwrap();
        assert_eq!(outcome, Outcome::Parked);

        let mut dlq = bus.subscribe("pipeline.deadletter", "probe").await.unwrap();
        let notices = dlq.poll(10).await.unwrap();
        assert_eq!(notices.len(), 1);

        // Prior version stays authoritative
        let schema = registry
            .get_latest_schema(first.source_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schema.version, 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, _bus, registry) = detector_setup().await;
        let source = registry.ensure_source("ghost").await.unwrap();

        let message = PipelineMessage::new(
            source.id,
            0,
            PipelineEvent::RawBatch {
                source_name: "ghost".to_string(),
                upload_path: dir.path().join("missing.csv"),
                uploaded_at: Utc::now(),
            },
        );

        let err = detector.process(&message).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_nullable_extension_resolves_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let (detector, _bus, registry) = detector_setup().await;

        let first = raw_message(
            &registry,
            dir.path(),
            "enrollment",
            "year,revenue\n2020,100000\n",
        )
        .await;
        detector.process(&first).await.unwrap();

        // New nullable column: region has an empty cell in the sample
        let second = raw_message(
            &registry,
            dir.path(),
            "enrollment",
            "year,revenue,region\n2021,150000,west\n2022,160000,\n",
        )
        .await;
        detector.process(&second).await.unwrap();

        let schema = registry
            .get_latest_schema(first.source_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schema.version, 2);
        assert!(schema.column("region").unwrap().nullable);
    }
}
