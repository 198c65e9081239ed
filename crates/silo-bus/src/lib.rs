//! silo-bus - durable, partitioned message bus for the Silo pipeline
//!
//! An embedded append-only log grouping related events into named topics.
//! Producers hash a key (the source identifier) onto a partition, which
//! preserves per-source publish order; consumers track their own committed
//! offset per topic partition and replay from it on restart, giving
//! at-least-once delivery.
//!
//! ```text
//! ┌──────────┐ publish(key)  ┌─────────────────────────┐  poll/commit ┌──────────┐
//! │ Producer │──────────────▶│ Topic ─ partition 0..N  │─────────────▶│ Consumer │
//! └──────────┘               │ (memory or segment log) │              │  group   │
//!                            └─────────────────────────┘              └──────────┘
//! ```
//!
//! The bus owns durability: partitions persist to length-prefixed segment
//! files, committed offsets to a JSON snapshot, and both are recovered on
//! open. Stages hold no state between messages.

mod bus;
mod config;
mod consumer;
mod error;
mod group;
mod message;
mod offsets;
mod partition;
mod topic;

pub mod storage;

pub use bus::MessageBus;
pub use config::BusConfig;
pub use consumer::{Consumer, ConsumerRecord};
pub use error::{Error, Result};
pub use group::{GroupCoordinator, MemberId};
pub use message::Message;
pub use offsets::OffsetStore;
pub use partition::Partition;
pub use topic::Topic;
