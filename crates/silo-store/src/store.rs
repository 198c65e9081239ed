//! Destination store interface
//!
//! The pipeline only writes: `ensure_table` + `upsert_rows` are the hot
//! path, the rest exists for existence/schema checks and for tests to
//! observe the externally visible result of a pipeline traversal.

use crate::error::{StoreError, StoreResult};
use crate::table::{ColumnarTable, UpsertOutcome};
use crate::value::CellValue;
use async_trait::async_trait;
use dashmap::DashMap;
use silo_registry::ColumnDef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One row addressed by its deterministic identity
#[derive(Debug, Clone)]
pub struct KeyedRow {
    /// Row identity: natural key or content hash, computed by the Loader
    pub identity: String,
    pub values: HashMap<String, CellValue>,
}

impl KeyedRow {
    pub fn new(identity: impl Into<String>, values: HashMap<String, CellValue>) -> Self {
        Self {
            identity: identity.into(),
            values,
        }
    }
}

/// Result of a bulk upsert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub rows_inserted: u64,
    pub rows_updated: u64,
}

impl WriteResult {
    pub fn total(&self) -> u64 {
        self.rows_inserted + self.rows_updated
    }
}

/// Columnar analytical store written by the Loader.
///
/// Implementations must make `upsert_rows` idempotent per identity:
/// redelivering a batch (at-least-once bus semantics) may flip inserts into
/// updates but never duplicates rows. Unreachability must surface as a
/// retryable [`StoreError::Unavailable`] rather than hanging.
#[async_trait]
pub trait AnalyticStore: Send + Sync {
    /// Create the table if absent; evolve it add-column-only if the desired
    /// column list is a superset of the existing one. Narrowing is an error.
    async fn ensure_table(&self, table: &str, columns: &[ColumnDef]) -> StoreResult<()>;

    /// Bulk upsert keyed rows. The whole batch is applied atomically with
    /// respect to readers of `row_count`/`scan`.
    async fn upsert_rows(&self, table: &str, rows: Vec<KeyedRow>) -> StoreResult<WriteResult>;

    async fn table_exists(&self, table: &str) -> StoreResult<bool>;

    async fn table_schema(&self, table: &str) -> StoreResult<Vec<ColumnDef>>;

    async fn row_count(&self, table: &str) -> StoreResult<u64>;

    /// Materialize all rows in arrival order (tests, diagnostics)
    async fn scan(&self, table: &str) -> StoreResult<Vec<HashMap<String, CellValue>>>;
}

/// In-memory columnar store
#[derive(Default)]
pub struct MemoryStore {
    tables: DashMap<String, RwLock<ColumnarTable>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the store; subsequent calls fail fast and retryable
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        info!("Analytic store closed");
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::unavailable("store is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl AnalyticStore for MemoryStore {
    async fn ensure_table(&self, table: &str, columns: &[ColumnDef]) -> StoreResult<()> {
        self.ensure_open()?;

        if !self.tables.contains_key(table) {
            info!(table, columns = columns.len(), "Creating destination table");
            self.tables.insert(
                table.to_string(),
                RwLock::new(ColumnarTable::new(table, columns.to_vec())),
            );
            return Ok(());
        }

        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let mut existing = entry.write().await;

        // Overlapping columns must keep their type; columns the desired list
        // lacks are left alone (an older schema version redelivered after
        // evolution is still writable), surplus desired columns are added.
        for current in existing.columns() {
            if let Some(desired) = columns.iter().find(|c| c.name == current.name) {
                if desired.column_type != current.column_type {
                    return Err(StoreError::schema_mismatch(
                        table,
                        format!(
                            "column '{}' is {}, desired {}",
                            current.name, current.column_type, desired.column_type
                        ),
                    ));
                }
            }
        }

        let missing: Vec<ColumnDef> = columns
            .iter()
            .filter(|c| existing.columns().iter().all(|e| e.name != c.name))
            .cloned()
            .collect();
        for column in missing {
            debug!(table, column = %column.name, "Adding column");
            existing.add_column(column)?;
        }
        Ok(())
    }

    async fn upsert_rows(&self, table: &str, rows: Vec<KeyedRow>) -> StoreResult<WriteResult> {
        self.ensure_open()?;
        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let mut target = entry.write().await;

        let mut result = WriteResult::default();
        for row in rows {
            match target.upsert(&row.identity, &row.values)? {
                UpsertOutcome::Inserted => result.rows_inserted += 1,
                UpsertOutcome::Updated => result.rows_updated += 1,
            }
        }
        debug!(
            table,
            inserted = result.rows_inserted,
            updated = result.rows_updated,
            "Upserted batch"
        );
        Ok(result)
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        Ok(self.tables.contains_key(table))
    }

    async fn table_schema(&self, table: &str) -> StoreResult<Vec<ColumnDef>> {
        self.ensure_open()?;
        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let guard = entry.read().await;
        Ok(guard.columns().to_vec())
    }

    async fn row_count(&self, table: &str) -> StoreResult<u64> {
        self.ensure_open()?;
        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let guard = entry.read().await;
        Ok(guard.row_count() as u64)
    }

    async fn scan(&self, table: &str) -> StoreResult<Vec<HashMap<String, CellValue>>> {
        self.ensure_open()?;
        let entry = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let guard = entry.read().await;
        Ok(guard.scan())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_registry::ColumnType;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("year", ColumnType::Integer),
            ColumnDef::required("revenue", ColumnType::Integer),
        ]
    }

    fn keyed(identity: &str, year: i64, revenue: i64) -> KeyedRow {
        KeyedRow::new(
            identity,
            HashMap::from([
                ("year".to_string(), CellValue::Integer(year)),
                ("revenue".to_string(), CellValue::Integer(revenue)),
            ]),
        )
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_table("t", &columns()).await.unwrap();

        let batch = vec![keyed("a", 2020, 100), keyed("b", 2021, 150)];
        let first = store.upsert_rows("t", batch.clone()).await.unwrap();
        assert_eq!(first.rows_inserted, 2);

        // Redelivery of the same batch updates in place, no duplicates
        let second = store.upsert_rows("t", batch).await.unwrap();
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(second.rows_updated, 2);
        assert_eq!(store.row_count("t").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ensure_table_add_column_only() {
        let store = MemoryStore::new();
        store.ensure_table("t", &columns()).await.unwrap();
        store.upsert_rows("t", vec![keyed("a", 2020, 100)]).await.unwrap();

        let mut extended = columns();
        extended.push(ColumnDef::nullable("region", ColumnType::Text));
        store.ensure_table("t", &extended).await.unwrap();

        let schema = store.table_schema("t").await.unwrap();
        assert_eq!(schema.len(), 3);
        let rows = store.scan("t").await.unwrap();
        assert_eq!(rows[0]["region"], CellValue::Null);

        // Retyping an existing column is refused
        let mut narrowed = columns();
        narrowed[1] = ColumnDef::required("revenue", ColumnType::Text);
        assert!(store.ensure_table("t", &narrowed).await.is_err());

        // A desired list missing an evolved column (old schema version
        // redelivered) is tolerated
        store.ensure_table("t", &columns()).await.unwrap();
        assert_eq!(store.table_schema("t").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_closed_store_fails_fast() {
        let store = MemoryStore::new();
        store.ensure_table("t", &columns()).await.unwrap();
        store.close();

        let err = store
            .upsert_rows("t", vec![keyed("a", 2020, 1)])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.row_count("absent").await,
            Err(StoreError::TableNotFound(_))
        ));
    }
}
