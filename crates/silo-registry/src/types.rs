//! Registry types and data structures
//!
//! This module provides the core types shared across the pipeline:
//! - [`SourceId`], [`Source`] - logical data origins
//! - [`ColumnType`], [`ColumnDef`], [`SchemaVersion`] - versioned column schemas
//! - [`TableMapping`] - binding of a source to its destination table
//! - [`SourceStatus`] - active / needs-review lifecycle

use crate::error::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Stable identifier for a logical data origin, assigned once by the
/// Connector and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub uuid::Uuid);

impl SourceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        self.0
    }

    /// Key bytes used for bus partitioning
    pub fn as_key(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for SourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// A logical data origin: one uploaded file lineage sharing a schema history.
///
/// Immutable once created; the pipeline never deletes sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: SourceId::new(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Column type, in increasing order of generality.
///
/// Inference tries each variant in this order and falls back to [`Text`]
/// when values are heterogeneous.
///
/// [`Text`]: ColumnType::Text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Timestamp,
    Text,
}

impl ColumnType {
    /// All types in inference order
    pub const INFERENCE_ORDER: [ColumnType; 5] = [
        ColumnType::Integer,
        ColumnType::Float,
        ColumnType::Boolean,
        ColumnType::Timestamp,
        ColumnType::Text,
    ];
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Text => "text",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "integer" | "int" => Ok(ColumnType::Integer),
            "float" | "double" => Ok(ColumnType::Float),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "timestamp" => Ok(ColumnType::Timestamp),
            "text" | "string" => Ok(ColumnType::Text),
            other => Err(format!("Unknown column type: {}", other)),
        }
    }
}

/// One column of a schema version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// An ordered, versioned column list for a source.
///
/// Version numbers increase monotonically per source. Once published a
/// version's column list never changes; evolution creates a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub source_id: SourceId,
    pub version: u32,
    pub columns: Vec<ColumnDef>,
    pub created_at: DateTime<Utc>,
}

impl SchemaVersion {
    pub fn new(source_id: SourceId, version: u32, columns: Vec<ColumnDef>) -> Self {
        Self {
            source_id,
            version,
            columns,
            created_at: Utc::now(),
        }
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Column names must be unique within a version
    pub fn validate(&self) -> RegistryResult<()> {
        validate_columns(&self.columns)
    }
}

/// Validate a proposed column list: non-empty, unique names
pub fn validate_columns(columns: &[ColumnDef]) -> RegistryResult<()> {
    if columns.is_empty() {
        return Err(RegistryError::invalid_schema("schema has no columns"));
    }
    let mut seen = HashSet::new();
    for column in columns {
        if column.name.trim().is_empty() {
            return Err(RegistryError::invalid_schema("empty column name"));
        }
        if !seen.insert(column.name.as_str()) {
            return Err(RegistryError::invalid_schema(format!(
                "duplicate column name '{}'",
                column.name
            )));
        }
    }
    Ok(())
}

/// Binding of a source (at a schema version) to its destination table.
///
/// One active mapping per source; a breaking schema change never silently
/// rewrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_id: SourceId,
    pub table_name: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
}

impl TableMapping {
    pub fn new(source_id: SourceId, table_name: impl Into<String>, schema_version: u32) -> Self {
        Self {
            source_id,
            table_name: table_name.into(),
            schema_version,
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle state of a source.
///
/// A source in `NeedsReview` is frozen: schema proposals are rejected until
/// an operator resolves the conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    Active,
    NeedsReview,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceStatus::Active => write!(f, "active"),
            SourceStatus::NeedsReview => write!(f, "needs_review"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_roundtrip() {
        let id = SourceId::new();
        let parsed: SourceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_column_type_parsing() {
        assert_eq!("integer".parse::<ColumnType>().unwrap(), ColumnType::Integer);
        assert_eq!("BOOL".parse::<ColumnType>().unwrap(), ColumnType::Boolean);
        assert!("decimal".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let columns = vec![
            ColumnDef::required("year", ColumnType::Integer),
            ColumnDef::required("year", ColumnType::Text),
        ];
        assert!(validate_columns(&columns).is_err());
    }

    #[test]
    fn test_schema_version_lookup() {
        let schema = SchemaVersion::new(
            SourceId::new(),
            1,
            vec![
                ColumnDef::required("year", ColumnType::Integer),
                ColumnDef::nullable("notes", ColumnType::Text),
            ],
        );
        assert!(schema.validate().is_ok());
        assert_eq!(
            schema.column("notes").map(|c| c.column_type),
            Some(ColumnType::Text)
        );
        assert!(schema.column("missing").is_none());
    }
}
