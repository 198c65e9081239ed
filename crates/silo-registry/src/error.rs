//! Registry errors

use thiserror::Error;

/// Metadata registry error types
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Schema version not found: {source_id} version {version}")]
    VersionNotFound { source_id: String, version: u32 },

    #[error("No mapping registered for source {0}")]
    MappingNotFound(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Mapping conflict for source {source_id}: {reason}")]
    MappingConflict { source_id: String, reason: String },

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Whether the operation may succeed if retried after backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Storage(_))
    }

    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        Self::InvalidSchema(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RegistryError::unavailable("down").is_retryable());
        assert!(!RegistryError::SourceNotFound("x".into()).is_retryable());
        assert!(!RegistryError::invalid_schema("dup column").is_retryable());
    }
}
