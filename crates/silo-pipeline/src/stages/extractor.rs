//! Extractor - typed row extraction
//!
//! Consumes schema-resolved events, streams the whole source file (not just
//! the detector's sample), and parses every line into a typed row per the
//! resolved schema. A cell that fails coercion becomes null when its column
//! is nullable; otherwise the row goes to the per-source error sink and is
//! excluded; malformed rows never abort a batch. Rows leave in bounded
//! batches whose sequence numbers are reserved from the registry, so
//! source-relative order survives downstream.

use crate::bus_client::SharedBusClient;
use crate::config::ExtractorSettings;
use crate::error::{StageError, StageResult};
use crate::events::{PipelineEvent, PipelineMessage, RowRecord};
use crate::runner::{Outcome, Stage};
use crate::stages::inference::coerce_value;
use async_trait::async_trait;
use serde::Serialize;
use silo_registry::{MetadataRegistry, SchemaVersion, SourceId};
use silo_store::CellValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// A row rejected during extraction, as written to the error sink
#[derive(Debug, Serialize)]
struct RejectedRow<'a> {
    source_id: String,
    upload_path: &'a Path,
    /// 1-based data row number (the header is row 0)
    row: usize,
    column: &'a str,
    reason: &'a str,
    cells: &'a [String],
}

/// Outcome of parsing one file
struct Extraction {
    batches: Vec<Vec<RowRecord>>,
    rejects: Vec<(usize, String, String, Vec<String>)>,
}

pub struct Extractor {
    bus: SharedBusClient,
    registry: Arc<MetadataRegistry>,
    settings: ExtractorSettings,
    rows_topic: String,
}

impl Extractor {
    pub fn new(
        bus: SharedBusClient,
        registry: Arc<MetadataRegistry>,
        settings: ExtractorSettings,
        rows_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            registry,
            settings,
            rows_topic: rows_topic.into(),
        }
    }

    /// Append rejected rows to the per-source JSONL error sink
    async fn sink_rejects(
        &self,
        source_id: SourceId,
        upload_path: &Path,
        rejects: &[(usize, String, String, Vec<String>)],
    ) -> StageResult<()> {
        if rejects.is_empty() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.settings.error_dir).await?;
        let path = self
            .settings
            .error_dir
            .join(format!("{}.jsonl", source_id));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let mut buffer = Vec::new();
        for (row, column, reason, cells) in rejects {
            let entry = RejectedRow {
                source_id: source_id.to_string(),
                upload_path,
                row: *row,
                column,
                reason,
                cells,
            };
            buffer.extend_from_slice(&serde_json::to_vec(&entry)?);
            buffer.push(b'\n');
        }
        file.write_all(&buffer).await?;
        file.flush().await?;

        info!(
            source_id = %source_id,
            rejected = rejects.len(),
            sink = %path.display(),
            "Recorded malformed rows"
        );
        Ok(())
    }
}

/// Blocking helper: parse the whole file into typed row batches plus the
/// rejects that failed coercion on a non-nullable column.
fn extract_file(
    path: &PathBuf,
    schema: &SchemaVersion,
    batch_rows: usize,
) -> StageResult<Extraction> {
    let file = std::fs::File::open(path).map_err(|e| {
        StageError::fatal(format!("upload {} unreadable: {}", path.display(), e))
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    // Map schema columns onto the file's header positions; a column the
    // file lacks reads as an empty cell (null for nullable columns).
    let headers = reader
        .headers()
        .map_err(|e| StageError::fatal(format!("unparseable header: {}", e)))?
        .clone();
    let positions: Vec<Option<usize>> = schema
        .columns
        .iter()
        .map(|column| headers.iter().position(|h| h.trim() == column.name))
        .collect();

    let mut batches = Vec::new();
    let mut current: Vec<RowRecord> = Vec::with_capacity(batch_rows);
    let mut rejects = Vec::new();

    for (index, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| StageError::fatal(format!("unparseable row: {}", e)))?;
        let cells: Vec<String> = record.iter().map(|c| c.to_string()).collect();

        let mut values = Vec::with_capacity(schema.columns.len());
        let mut rejection: Option<(String, String)> = None;

        for (column, position) in schema.columns.iter().zip(&positions) {
            let raw = position
                .and_then(|p| record.get(p))
                .unwrap_or("");
            match coerce_value(raw, column) {
                Ok(CellValue::Null) if !column.nullable => {
                    rejection = Some((
                        column.name.clone(),
                        format!("null in non-nullable column '{}'", column.name),
                    ));
                    break;
                }
                Ok(value) => values.push(value),
                Err(reason) if column.nullable => {
                    // Failed coercion in a nullable column degrades to null
                    debug!(column = %column.name, reason, "Coercion failed, writing null");
                    values.push(CellValue::Null);
                }
                Err(reason) => {
                    rejection = Some((column.name.clone(), reason));
                    break;
                }
            }
        }

        match rejection {
            Some((column, reason)) => rejects.push((index + 1, column, reason, cells)),
            None => {
                current.push(RowRecord::new(values));
                if current.len() >= batch_rows {
                    batches.push(std::mem::take(&mut current));
                }
            }
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }

    Ok(Extraction { batches, rejects })
}

#[async_trait]
impl Stage for Extractor {
    fn name(&self) -> &'static str {
        "extractor"
    }

    async fn process(&self, message: &PipelineMessage) -> StageResult<Outcome> {
        let PipelineEvent::SchemaResolved { upload_path } = &message.event else {
            return Err(StageError::fatal(format!(
                "unexpected event '{}' on resolved topic",
                message.event.kind()
            )));
        };
        let version = message
            .schema_version
            .ok_or_else(|| StageError::fatal("schema-resolved event without a version"))?;
        let schema = self.registry.get_schema(message.source_id, version).await?;

        let path = upload_path.clone();
        let batch_rows = self.settings.batch_rows;
        let schema_for_task = schema.clone();
        let extraction = tokio::task::spawn_blocking(move || {
            extract_file(&path, &schema_for_task, batch_rows)
        })
        .await
        .map_err(|e| StageError::Internal(format!("extract task: {}", e)))??;

        self.sink_rejects(message.source_id, upload_path, &extraction.rejects)
            .await?;

        let mut published_rows = 0usize;
        for rows in extraction.batches {
            published_rows += rows.len();
            let sequence = self.registry.next_sequence(message.source_id).await?;
            let batch = PipelineMessage::new(
                message.source_id,
                sequence,
                PipelineEvent::RowBatch {
                    columns: schema.columns.clone(),
                    rows,
                },
            )
            .with_schema_version(version);
            self.bus.publish(&self.rows_topic, &batch).await?;
        }

        info!(
            source_id = %message.source_id,
            version,
            rows = published_rows,
            rejected = extraction.rejects.len(),
            "Extraction complete"
        );
        Ok(Outcome::Committed)
    }
}
