//! Columnar table representation
//!
//! Each table holds one value vector per column plus a row-identity index.
//! Upserts with a known identity overwrite the existing row in place; new
//! identities append, so rows keep their arrival order.

use crate::error::{StoreError, StoreResult};
use crate::value::CellValue;
use chrono::{DateTime, Utc};
use silo_registry::{ColumnDef, ColumnType};
use std::collections::HashMap;

/// Typed storage for one column
#[derive(Debug, Clone)]
pub enum ColumnData {
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Boolean(Vec<Option<bool>>),
    Timestamp(Vec<Option<DateTime<Utc>>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    fn new(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Integer => ColumnData::Integer(Vec::new()),
            ColumnType::Float => ColumnData::Float(Vec::new()),
            ColumnType::Boolean => ColumnData::Boolean(Vec::new()),
            ColumnType::Timestamp => ColumnData::Timestamp(Vec::new()),
            ColumnType::Text => ColumnData::Text(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnData::Integer(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Boolean(v) => v.len(),
            ColumnData::Timestamp(v) => v.len(),
            ColumnData::Text(v) => v.len(),
        }
    }

    fn push_null(&mut self) {
        match self {
            ColumnData::Integer(v) => v.push(None),
            ColumnData::Float(v) => v.push(None),
            ColumnData::Boolean(v) => v.push(None),
            ColumnData::Timestamp(v) => v.push(None),
            ColumnData::Text(v) => v.push(None),
        }
    }

    fn push(&mut self, value: &CellValue) -> StoreResult<()> {
        self.push_null();
        let last = self.len() - 1;
        self.set(last, value)
    }

    fn set(&mut self, index: usize, value: &CellValue) -> StoreResult<()> {
        match (self, value) {
            (ColumnData::Integer(v), CellValue::Integer(x)) => v[index] = Some(*x),
            (ColumnData::Float(v), CellValue::Float(x)) => v[index] = Some(*x),
            (ColumnData::Boolean(v), CellValue::Boolean(x)) => v[index] = Some(*x),
            (ColumnData::Timestamp(v), CellValue::Timestamp(x)) => v[index] = Some(*x),
            (ColumnData::Text(v), CellValue::Text(x)) => v[index] = Some(x.clone()),
            (data, CellValue::Null) => match data {
                ColumnData::Integer(v) => v[index] = None,
                ColumnData::Float(v) => v[index] = None,
                ColumnData::Boolean(v) => v[index] = None,
                ColumnData::Timestamp(v) => v[index] = None,
                ColumnData::Text(v) => v[index] = None,
            },
            (data, value) => {
                return Err(StoreError::TypeMismatch {
                    column: String::new(),
                    expected: data.column_type().to_string(),
                    actual: value
                        .column_type()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "null".to_string()),
                });
            }
        }
        Ok(())
    }

    fn get(&self, index: usize) -> CellValue {
        match self {
            ColumnData::Integer(v) => v[index].map(CellValue::Integer).unwrap_or(CellValue::Null),
            ColumnData::Float(v) => v[index].map(CellValue::Float).unwrap_or(CellValue::Null),
            ColumnData::Boolean(v) => v[index].map(CellValue::Boolean).unwrap_or(CellValue::Null),
            ColumnData::Timestamp(v) => {
                v[index].map(CellValue::Timestamp).unwrap_or(CellValue::Null)
            }
            ColumnData::Text(v) => v[index]
                .as_ref()
                .map(|s| CellValue::Text(s.clone()))
                .unwrap_or(CellValue::Null),
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Integer(_) => ColumnType::Integer,
            ColumnData::Float(_) => ColumnType::Float,
            ColumnData::Boolean(_) => ColumnType::Boolean,
            ColumnData::Timestamp(_) => ColumnType::Timestamp,
            ColumnData::Text(_) => ColumnType::Text,
        }
    }
}

/// A columnar table with upsert-by-identity semantics
pub struct ColumnarTable {
    name: String,
    columns: Vec<ColumnDef>,
    data: Vec<ColumnData>,
    /// Row identity -> row index
    index: HashMap<String, usize>,
}

/// Whether an upsert inserted a new row or rewrote an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl ColumnarTable {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let data = columns
            .iter()
            .map(|c| ColumnData::new(c.column_type))
            .collect();
        Self {
            name: name.into(),
            columns,
            data,
            index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.index.len()
    }

    /// Add a column. Only nullable additions are legal; existing rows read
    /// null for the new column.
    pub fn add_column(&mut self, column: ColumnDef) -> StoreResult<()> {
        if self.columns.iter().any(|c| c.name == column.name) {
            return Err(StoreError::schema_mismatch(
                &self.name,
                format!("column '{}' already exists", column.name),
            ));
        }
        if !column.nullable {
            return Err(StoreError::schema_mismatch(
                &self.name,
                format!("cannot add non-nullable column '{}'", column.name),
            ));
        }

        let mut data = ColumnData::new(column.column_type);
        for _ in 0..self.row_count() {
            data.push_null();
        }
        self.columns.push(column);
        self.data.push(data);
        Ok(())
    }

    /// Insert or overwrite the row with the given identity.
    ///
    /// Values are taken by column name; a column absent from `values` is
    /// written as null. Type and nullability are enforced per column.
    pub fn upsert(
        &mut self,
        identity: &str,
        values: &HashMap<String, CellValue>,
    ) -> StoreResult<UpsertOutcome> {
        for name in values.keys() {
            if !self.columns.iter().any(|c| &c.name == name) {
                return Err(StoreError::ColumnNotFound {
                    table: self.name.clone(),
                    column: name.clone(),
                });
            }
        }
        // Validate every column before touching any vector: a bad value in
        // column k must not leave columns 0..k half-written.
        for column in &self.columns {
            let value = values.get(&column.name).unwrap_or(&CellValue::Null);
            if value.is_null() && !column.nullable {
                return Err(StoreError::NullViolation(column.name.clone()));
            }
            if !value.fits(column.column_type) {
                return Err(StoreError::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.column_type.to_string(),
                    actual: value
                        .column_type()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "null".to_string()),
                });
            }
        }

        match self.index.get(identity).copied() {
            Some(row) => {
                for (column, data) in self.columns.iter().zip(self.data.iter_mut()) {
                    let value = values.get(&column.name).unwrap_or(&CellValue::Null);
                    data.set(row, value).map_err(|e| match e {
                        StoreError::TypeMismatch { expected, actual, .. } => {
                            StoreError::TypeMismatch {
                                column: column.name.clone(),
                                expected,
                                actual,
                            }
                        }
                        other => other,
                    })?;
                }
                Ok(UpsertOutcome::Updated)
            }
            None => {
                for (column, data) in self.columns.iter().zip(self.data.iter_mut()) {
                    let value = values.get(&column.name).unwrap_or(&CellValue::Null);
                    data.push(value).map_err(|e| match e {
                        StoreError::TypeMismatch { expected, actual, .. } => {
                            StoreError::TypeMismatch {
                                column: column.name.clone(),
                                expected,
                                actual,
                            }
                        }
                        other => other,
                    })?;
                }
                let row = self.data[0].len() - 1;
                self.index.insert(identity.to_string(), row);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    /// Materialize all rows in arrival order
    pub fn scan(&self) -> Vec<HashMap<String, CellValue>> {
        let rows = self.data.first().map(|d| d.len()).unwrap_or(0);
        (0..rows)
            .map(|row| {
                self.columns
                    .iter()
                    .zip(self.data.iter())
                    .map(|(column, data)| (column.name.clone(), data.get(row)))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ColumnarTable {
        ColumnarTable::new(
            "src_enrollment",
            vec![
                ColumnDef::required("year", ColumnType::Integer),
                ColumnDef::required("revenue", ColumnType::Integer),
            ],
        )
    }

    fn row(year: i64, revenue: i64) -> HashMap<String, CellValue> {
        HashMap::from([
            ("year".to_string(), CellValue::Integer(year)),
            ("revenue".to_string(), CellValue::Integer(revenue)),
        ])
    }

    #[test]
    fn test_upsert_insert_then_update() {
        let mut table = table();

        assert_eq!(
            table.upsert("k1", &row(2020, 100_000)).unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            table.upsert("k1", &row(2020, 120_000)).unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(table.row_count(), 1);

        let rows = table.scan();
        assert_eq!(rows[0]["revenue"], CellValue::Integer(120_000));
    }

    #[test]
    fn test_rows_keep_arrival_order() {
        let mut table = table();
        table.upsert("k1", &row(2020, 1)).unwrap();
        table.upsert("k2", &row(2021, 2)).unwrap();
        table.upsert("k3", &row(2022, 3)).unwrap();

        let years: Vec<_> = table.scan().into_iter().map(|r| r["year"].clone()).collect();
        assert_eq!(
            years,
            vec![
                CellValue::Integer(2020),
                CellValue::Integer(2021),
                CellValue::Integer(2022)
            ]
        );
    }

    #[test]
    fn test_null_violation() {
        let mut table = table();
        let mut values = row(2020, 1);
        values.insert("year".to_string(), CellValue::Null);
        assert!(matches!(
            table.upsert("k", &values),
            Err(StoreError::NullViolation(c)) if c == "year"
        ));
        // The failed upsert left nothing behind
        assert_eq!(table.row_count(), 0);
    }

    #[test]
    fn test_type_mismatch_names_column() {
        let mut table = table();
        let mut values = row(2020, 1);
        values.insert("revenue".to_string(), CellValue::from("lots"));
        match table.upsert("k", &values) {
            Err(StoreError::TypeMismatch { column, .. }) => assert_eq!(column, "revenue"),
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_add_column_backfills_null() {
        let mut table = table();
        table.upsert("k1", &row(2020, 1)).unwrap();

        table
            .add_column(ColumnDef::nullable("region", ColumnType::Text))
            .unwrap();

        let rows = table.scan();
        assert_eq!(rows[0]["region"], CellValue::Null);

        // Non-nullable additions are refused
        assert!(table
            .add_column(ColumnDef::required("must", ColumnType::Text))
            .is_err());
    }

    #[test]
    fn test_unknown_column_rejected() {
        let mut table = table();
        let mut values = row(2020, 1);
        values.insert("surprise".to_string(), CellValue::Integer(1));
        assert!(matches!(
            table.upsert("k", &values),
            Err(StoreError::ColumnNotFound { .. })
        ));
    }
}
