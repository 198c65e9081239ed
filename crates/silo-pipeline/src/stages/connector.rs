//! Connector - upload intake
//!
//! Accepts an uploaded tabular file, resolves (or creates) its source,
//! persists the raw bytes to durable storage under a path keyed by source id
//! and upload timestamp, and publishes exactly one raw-batch event per
//! accepted upload. Rejections are synchronous and publish nothing.

use crate::bus_client::SharedBusClient;
use crate::config::ConnectorSettings;
use crate::events::{PipelineEvent, PipelineMessage};
use chrono::Utc;
use silo_registry::{MetadataRegistry, SourceId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Synchronous rejection reasons reported to the uploader
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("empty file")]
    EmptyFile,

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Result of an accepted upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub source_id: SourceId,
    pub upload_path: PathBuf,
    pub sequence: u64,
}

/// The upload intake stage. Driven synchronously by callers; not a consumer.
pub struct Connector {
    bus: SharedBusClient,
    registry: Arc<MetadataRegistry>,
    settings: ConnectorSettings,
    raw_topic: String,
}

impl Connector {
    pub fn new(
        bus: SharedBusClient,
        registry: Arc<MetadataRegistry>,
        settings: ConnectorSettings,
        raw_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            registry,
            settings,
            raw_topic: raw_topic.into(),
        }
    }

    /// Accept an upload from a file on disk
    pub async fn accept_file(
        &self,
        path: &Path,
        source_name: &str,
    ) -> Result<UploadReceipt, UploadError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| UploadError::StorageUnavailable(format!("read {}: {}", path.display(), e)))?;
        self.accept_upload(source_name, &file_name, &bytes).await
    }

    /// Accept an upload from raw bytes.
    ///
    /// Exactly one raw-batch event is published per accepted upload; any
    /// rejection leaves the bus untouched.
    pub async fn accept_upload(
        &self,
        source_name: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<UploadReceipt, UploadError> {
        self.validate(file_name, bytes)?;

        let source = self
            .registry
            .ensure_source(source_name)
            .await
            .map_err(|e| UploadError::StorageUnavailable(format!("registry: {}", e)))?;

        let uploaded_at = Utc::now();
        let upload_path = self.store_raw(source.id, file_name, bytes, uploaded_at.timestamp_millis())
            .await?;

        let sequence = self
            .registry
            .next_sequence(source.id)
            .await
            .map_err(|e| UploadError::StorageUnavailable(format!("registry: {}", e)))?;

        let message = PipelineMessage::new(
            source.id,
            sequence,
            PipelineEvent::RawBatch {
                source_name: source.name.clone(),
                upload_path: upload_path.clone(),
                uploaded_at,
            },
        );

        if let Err(e) = self.bus.publish(&self.raw_topic, &message).await {
            // No event made it out, so the upload is rejected as a whole;
            // remove the stored bytes so a retry starts clean.
            if let Err(cleanup) = tokio::fs::remove_file(&upload_path).await {
                warn!(path = %upload_path.display(), error = %cleanup, "Failed to clean up rejected upload");
            }
            return Err(UploadError::StorageUnavailable(format!("bus: {}", e)));
        }

        info!(
            source_id = %source.id,
            source_name,
            path = %upload_path.display(),
            bytes = bytes.len(),
            sequence,
            "Accepted upload"
        );

        Ok(UploadReceipt {
            source_id: source.id,
            upload_path,
            sequence,
        })
    }

    fn validate(&self, file_name: &str, bytes: &[u8]) -> Result<(), UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::EmptyFile);
        }

        let extension = Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !self.settings.extensions.iter().any(|e| *e == extension) {
            return Err(UploadError::UnsupportedFormat(format!(
                "extension '{}' not in {:?}",
                extension, self.settings.extensions
            )));
        }

        // Delimited text must at least be UTF-8 in its first chunk
        let head = &bytes[..bytes.len().min(4096)];
        if std::str::from_utf8(head).is_err() {
            return Err(UploadError::UnsupportedFormat(
                "file is not valid UTF-8 text".to_string(),
            ));
        }
        Ok(())
    }

    async fn store_raw(
        &self,
        source_id: SourceId,
        file_name: &str,
        bytes: &[u8],
        timestamp_millis: i64,
    ) -> Result<PathBuf, UploadError> {
        let extension = Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "csv".to_string());

        let dir = self.settings.upload_dir.join(source_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| UploadError::StorageUnavailable(format!("mkdir {}: {}", dir.display(), e)))?;

        let path = dir.join(format!("{}-upload.{}", timestamp_millis, extension));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| UploadError::StorageUnavailable(format!("write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}
