use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single record on the bus.
///
/// The bus treats keys and values as opaque bytes; the pipeline layers its
/// typed envelope on top. Records are immutable once appended: a stage that
/// needs to "modify" one publishes a new record downstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Offset within the partition, assigned on append
    pub offset: u64,

    /// Partitioning key (the source identifier in the pipeline)
    pub key: Option<Vec<u8>>,

    /// Payload
    pub value: Vec<u8>,

    /// Producer timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message without a key
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            offset: 0,
            key: None,
            value: value.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a message with a partitioning key
    pub fn with_key(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            offset: 0,
            key: Some(key.into()),
            value: value.into(),
            timestamp: Utc::now(),
        }
    }

    /// Key as bytes, if present
    pub fn key_bytes(&self) -> Option<Bytes> {
        self.key.as_ref().map(|k| Bytes::copy_from_slice(k))
    }

    /// Serialize to the on-disk frame encoding
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from the on-disk frame encoding
    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
