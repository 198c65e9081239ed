//! Pipeline message envelope and per-topic event payloads
//!
//! Every hop carries a [`PipelineMessage`]: the source identifier (also the
//! bus partitioning key), the schema version once known, a per-source
//! sequence number, a producer timestamp, and the event payload. Messages
//! are produced by exactly one stage, consumed by exactly one downstream
//! stage, and never mutated after publish.

use crate::error::{StageError, StageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use silo_registry::{ColumnDef, SourceId};
use silo_store::CellValue;
use std::path::PathBuf;

/// One parsed (or transformed) data row, values ordered per the batch's
/// column list. Materialized by the Extractor, possibly rewritten by the
/// Transformer, discarded by the Loader after a successful upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub values: Vec<CellValue>,
}

impl RowRecord {
    pub fn new(values: Vec<CellValue>) -> Self {
        Self { values }
    }
}

/// Event payloads, one variant per topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Connector → Detector: a raw upload landed in durable storage
    RawBatch {
        source_name: String,
        upload_path: PathBuf,
        uploaded_at: DateTime<Utc>,
    },

    /// Detector → Extractor: the upload's schema is registered
    SchemaResolved { upload_path: PathBuf },

    /// Extractor → Transformer: a bounded batch of typed rows
    RowBatch {
        columns: Vec<ColumnDef>,
        rows: Vec<RowRecord>,
    },

    /// Transformer → Loader: rows with the source's rule set applied.
    /// `columns` reflects renames/drops/derivations, so the batch is
    /// self-describing for the Loader.
    TransformedBatch {
        columns: Vec<ColumnDef>,
        rows: Vec<RowRecord>,
    },

    /// Any stage → dead-letter topic: manual intervention required
    NeedsReview { stage: String, reason: String },
}

impl PipelineEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RawBatch { .. } => "raw_batch",
            Self::SchemaResolved { .. } => "schema_resolved",
            Self::RowBatch { .. } => "row_batch",
            Self::TransformedBatch { .. } => "transformed_batch",
            Self::NeedsReview { .. } => "needs_review",
        }
    }
}

/// The envelope published on every topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMessage {
    pub source_id: SourceId,

    /// Resolved schema version, absent before detection
    pub schema_version: Option<u32>,

    /// Monotonically increasing per source (reserved from the registry)
    pub sequence: u64,

    pub produced_at: DateTime<Utc>,

    pub event: PipelineEvent,
}

impl PipelineMessage {
    pub fn new(source_id: SourceId, sequence: u64, event: PipelineEvent) -> Self {
        Self {
            source_id,
            schema_version: None,
            sequence,
            produced_at: Utc::now(),
            event,
        }
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Bus partitioning key: the source identifier
    pub fn key(&self) -> Vec<u8> {
        self.source_id.as_key()
    }

    pub fn encode(&self) -> StageResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> StageResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| StageError::Serialization(format!("undecodable envelope: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_registry::ColumnType;

    #[test]
    fn test_envelope_roundtrip() {
        let message = PipelineMessage::new(
            SourceId::new(),
            7,
            PipelineEvent::RawBatch {
                source_name: "enrollment".to_string(),
                upload_path: PathBuf::from("data/uploads/x/1.csv"),
                uploaded_at: Utc::now(),
            },
        );

        let bytes = message.encode().unwrap();
        let decoded = PipelineMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.event.kind(), "raw_batch");
    }

    #[test]
    fn test_row_batch_preserves_column_order() {
        let columns = vec![
            ColumnDef::required("year", ColumnType::Integer),
            ColumnDef::required("revenue", ColumnType::Integer),
        ];
        let message = PipelineMessage::new(
            SourceId::new(),
            0,
            PipelineEvent::RowBatch {
                columns: columns.clone(),
                rows: vec![RowRecord::new(vec![
                    CellValue::Integer(2020),
                    CellValue::Integer(100_000),
                ])],
            },
        )
        .with_schema_version(1);

        let decoded = PipelineMessage::decode(&message.encode().unwrap()).unwrap();
        match decoded.event {
            PipelineEvent::RowBatch { columns: c, rows } => {
                assert_eq!(c, columns);
                assert_eq!(rows[0].values[0], CellValue::Integer(2020));
            }
            other => panic!("expected RowBatch, got {:?}", other),
        }
        assert_eq!(decoded.schema_version, Some(1));
    }

    #[test]
    fn test_undecodable_payload_is_permanent() {
        let err = PipelineMessage::decode(b"not json").unwrap_err();
        assert!(!err.is_retryable());
    }
}
