//! silo-registry - schema and metadata registry for the Silo pipeline
//!
//! The one component holding durable cross-stage state: canonical column
//! schemas per logical source (immutable, versioned), destination table
//! mappings, review status, and per-source sequence counters. Consulted by
//! the Detector, Transformer and Loader; it never publishes events itself.
//!
//! Evolution contract: a proposal identical to the current version returns
//! it unchanged; a proposal that only adds nullable columns creates a new
//! version; anything else is a conflict that freezes the source for manual
//! review. Mutations for one source are serialized with a per-source
//! compare-and-set, never a global lock.

mod compatibility;
mod error;
mod registry;
mod types;

pub mod storage;

pub use compatibility::{diff, SchemaConflict, SchemaDiff};
pub use error::{RegistryError, RegistryResult};
pub use registry::{MetadataRegistry, SchemaProposal};
pub use storage::{MemoryStorage, RegistryStorage, Storage};
pub use types::{
    validate_columns, ColumnDef, ColumnType, SchemaVersion, Source, SourceId, SourceStatus,
    TableMapping,
};
