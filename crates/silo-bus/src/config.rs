use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bus configuration, supplied once at process start.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Directory for segment files and committed offsets.
    /// `None` keeps everything in memory (tests, local development).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Partition count for auto-created topics
    #[serde(default = "default_partitions")]
    pub default_partitions: u32,

    /// Flush segment files after every append.
    /// Slower, but a crash loses nothing that was acknowledged.
    #[serde(default = "default_true")]
    pub flush_each_append: bool,
}

fn default_partitions() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_partitions: default_partitions(),
            flush_each_append: true,
        }
    }
}

impl BusConfig {
    /// In-memory configuration for tests
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            ..Default::default()
        }
    }

    /// File-backed configuration rooted at `data_dir`
    pub fn durable(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        }
    }
}
