//! Column type inference and value coercion
//!
//! Inference feeds on a bounded sample of raw string cells per column and
//! picks the least general type every non-empty value satisfies, trying
//! integer → float → boolean → timestamp and falling back to text when the
//! values are heterogeneous. Empty cells mark the column nullable.
//!
//! Coercion is the same contract applied at extraction time: one raw cell
//! against one declared column type.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use silo_registry::{ColumnDef, ColumnType};
use silo_store::CellValue;

/// Timestamp layouts accepted in addition to RFC 3339
const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d"];

/// Whether a non-empty raw cell satisfies `column_type`
fn satisfies(raw: &str, column_type: ColumnType) -> bool {
    match column_type {
        ColumnType::Integer => raw.parse::<i64>().is_ok(),
        ColumnType::Float => raw.parse::<f64>().is_ok(),
        ColumnType::Boolean => matches!(
            raw.to_ascii_lowercase().as_str(),
            "true" | "false"
        ),
        ColumnType::Timestamp => parse_timestamp(raw).is_some(),
        ColumnType::Text => true,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in TIMESTAMP_FORMATS.iter().take(2) {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, TIMESTAMP_FORMATS[2]) {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Sample-driven schema inference for one delimited file
pub struct TypeInference {
    columns: Vec<String>,
    /// Candidate types still satisfied by every non-empty sampled value
    candidates: Vec<Vec<ColumnType>>,
    nullable: Vec<bool>,
    sample_count: usize,
}

impl TypeInference {
    /// Start inference over the given header row
    pub fn new(columns: Vec<String>) -> Self {
        let candidates = columns
            .iter()
            .map(|_| ColumnType::INFERENCE_ORDER.to_vec())
            .collect();
        let nullable = vec![false; columns.len()];
        Self {
            columns,
            candidates,
            nullable,
            sample_count: 0,
        }
    }

    /// Add one sampled record. Short records mark the missing trailing
    /// columns nullable; surplus cells are ignored.
    pub fn add_record(&mut self, cells: &[&str]) {
        for (index, candidates) in self.candidates.iter_mut().enumerate() {
            match cells.get(index).map(|c| c.trim()) {
                None | Some("") => self.nullable[index] = true,
                Some(raw) => candidates.retain(|t| satisfies(raw, *t)),
            }
        }
        self.sample_count += 1;
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Finalize: every column gets its least general surviving candidate
    /// (text always survives).
    pub fn finalize(self) -> Vec<ColumnDef> {
        self.columns
            .into_iter()
            .zip(self.candidates)
            .zip(self.nullable)
            .map(|((name, candidates), nullable)| ColumnDef {
                name,
                column_type: candidates.first().copied().unwrap_or(ColumnType::Text),
                nullable,
            })
            .collect()
    }
}

/// Coerce one raw cell to its declared column type.
///
/// Empty cells are null. A value that fails to parse is an error carrying a
/// human-readable reason; the caller decides between null (nullable column)
/// and the error sink.
pub fn coerce_value(raw: &str, column: &ColumnDef) -> Result<CellValue, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(CellValue::Null);
    }

    match column.column_type {
        ColumnType::Integer => trimmed
            .parse::<i64>()
            .map(CellValue::Integer)
            .map_err(|_| format!("'{}' is not an integer", trimmed)),
        ColumnType::Float => trimmed
            .parse::<f64>()
            .map(CellValue::Float)
            .map_err(|_| format!("'{}' is not a float", trimmed)),
        ColumnType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" => Ok(CellValue::Boolean(true)),
            "false" => Ok(CellValue::Boolean(false)),
            _ => Err(format!("'{}' is not a boolean", trimmed)),
        },
        ColumnType::Timestamp => parse_timestamp(trimmed)
            .map(CellValue::Timestamp)
            .ok_or_else(|| format!("'{}' is not a timestamp", trimmed)),
        ColumnType::Text => Ok(CellValue::Text(trimmed.to_string())),
    }
}
