//! silo-store - columnar analytical destination store
//!
//! The externally observable end of the pipeline: one columnar table per
//! source, written by the Loader via idempotent bulk upserts keyed by a
//! deterministic row identity. Queried by downstream reporting tools; the
//! pipeline itself only reads back for existence and schema checks.

mod error;
mod store;
mod table;
mod value;

pub use error::{StoreError, StoreResult};
pub use store::{AnalyticStore, KeyedRow, MemoryStore, WriteResult};
pub use table::{ColumnarTable, UpsertOutcome};
pub use value::CellValue;
