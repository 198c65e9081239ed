//! Error types for the pipeline runtime and stages
//!
//! Two levels, mirroring the failure taxonomy: [`PipelineError`] for the
//! runtime (config loading, CLI, shutdown), [`StageError`] for per-message
//! stage work. Stage errors classify into transient-infra (retryable),
//! data-quality (row-scoped, absorbed locally), schema-conflict (freeze +
//! review) and logic/fatal (dead-letter), and the runner keys its state
//! machine off that classification.

use std::fmt;
use thiserror::Error;

/// Result type alias for the pipeline runtime
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for stage operations
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Main error type for the pipeline runtime
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dependency could not be attached at startup
    #[error("Failed to attach to {dependency} after {attempts} attempts: {message}")]
    AttachExhausted {
        dependency: String,
        attempts: u32,
        message: String,
    },

    /// Stage failure surfaced to the runtime
    #[error("Stage '{stage}' error: {message}")]
    Stage { stage: String, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Stage error (from individual stages)
    #[error(transparent)]
    StageError(#[from] StageError),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn stage(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Errors that can occur while a stage processes one message
#[derive(Debug, Error)]
pub enum StageError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Bus temporarily unreachable (transient)
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// Registry temporarily unreachable (transient)
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Destination store temporarily unreachable (transient)
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Malformed row or failed coercion, isolated to the offending rows
    #[error("data quality: {0}")]
    DataQuality(String),

    /// Incompatible schema change; the source is frozen for review
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    /// Payload that cannot be decoded (permanent)
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Permanent failure that must not be retried
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StageError {
    /// Whether the message should be re-queued and retried after backoff.
    /// Everything else is permanent for this message.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BusUnavailable(_)
                | Self::RegistryUnavailable(_)
                | Self::StoreUnavailable(_)
                | Self::Io(_)
        )
    }

    /// Whether this is a schema conflict that parks the partition rather
    /// than dead-lettering and moving on.
    pub fn is_schema_conflict(&self) -> bool {
        matches!(self, Self::SchemaConflict(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn data_quality(msg: impl Into<String>) -> Self {
        Self::DataQuality(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

impl From<silo_bus::Error> for StageError {
    fn from(e: silo_bus::Error) -> Self {
        if e.is_retryable() {
            Self::BusUnavailable(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

impl From<silo_registry::RegistryError> for StageError {
    fn from(e: silo_registry::RegistryError) -> Self {
        if e.is_retryable() {
            Self::RegistryUnavailable(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

impl From<silo_store::StoreError> for StageError {
    fn from(e: silo_store::StoreError) -> Self {
        if e.is_retryable() {
            Self::StoreUnavailable(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

/// Stage status for health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Attaching to dependencies
    Starting,
    /// Consuming normally
    Running,
    /// Temporarily degraded (backing off)
    Unhealthy,
    /// Stopped cleanly
    Stopped,
    /// Failed permanently
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StageError::BusUnavailable("down".into()).is_retryable());
        assert!(StageError::StoreUnavailable("down".into()).is_retryable());
        assert!(!StageError::data_quality("bad row").is_retryable());
        assert!(!StageError::SchemaConflict("retyped".into()).is_retryable());
        assert!(!StageError::fatal("boom").is_retryable());
    }

    #[test]
    fn test_schema_conflict_is_not_dead_letter_path() {
        let err = StageError::SchemaConflict("column removed".into());
        assert!(err.is_schema_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_bus_error_conversion_preserves_class() {
        let transient: StageError = silo_bus::Error::unavailable("closed").into();
        assert!(transient.is_retryable());

        let permanent: StageError = silo_bus::Error::TopicNotFound("t".into()).into();
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_attach_exhausted_display() {
        let err = PipelineError::AttachExhausted {
            dependency: "bus".into(),
            attempts: 10,
            message: "connection refused".into(),
        };
        assert!(err.to_string().contains("after 10 attempts"));
    }
}
