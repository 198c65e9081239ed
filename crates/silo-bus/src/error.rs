use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(u32),

    #[error("Invalid offset {offset} for partition {partition} (high watermark {high_watermark})")]
    InvalidOffset {
        partition: u32,
        offset: u64,
        high_watermark: u64,
    },

    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Consumer is no longer a member of group '{0}'")]
    NotAMember(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the operation may succeed if retried after backoff.
    ///
    /// An unreachable or closed bus is transient from the caller's point of
    /// view; a missing topic or a corrupt frame is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
