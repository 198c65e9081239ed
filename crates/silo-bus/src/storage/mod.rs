//! Partition storage backends
//!
//! A partition delegates persistence to a [`PartitionLog`]: an append-only
//! sequence of messages addressed by contiguous offsets. Two backends exist:
//! `memory` for tests and local development, `segment` for a file-backed log
//! that survives process restarts. The bus, not any pipeline stage, owns
//! message durability.

mod memory;
mod segment;

pub use memory::MemoryLog;
pub use segment::SegmentLog;

use crate::config::BusConfig;
use crate::message::Message;
use crate::Result;

/// Append-only storage for a single partition.
///
/// Offsets are assigned by the partition before `append` is called and are
/// contiguous starting at 0.
pub trait PartitionLog: Send + Sync {
    /// Persist a message at its pre-assigned offset
    fn append(&mut self, message: &Message) -> Result<()>;

    /// Read up to `max_messages` starting at `start_offset`
    fn read(&self, start_offset: u64, max_messages: usize) -> Result<Vec<Message>>;

    /// The next offset to be assigned (== number of messages ever appended)
    fn next_offset(&self) -> u64;

    /// Force buffered writes to stable storage
    fn flush(&mut self) -> Result<()>;
}

/// Open the configured backend for one topic partition.
///
/// Segment logs replay their file on open, so a re-opened partition resumes
/// exactly where the previous process stopped.
pub fn open_log(config: &BusConfig, topic: &str, partition: u32) -> Result<Box<dyn PartitionLog>> {
    match &config.data_dir {
        Some(dir) => {
            let log = SegmentLog::open(dir, topic, partition, config.flush_each_append)?;
            Ok(Box::new(log))
        }
        None => Ok(Box::new(MemoryLog::new())),
    }
}
