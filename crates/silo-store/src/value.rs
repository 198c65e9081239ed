use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use silo_registry::ColumnType;

/// A single typed cell in a row.
///
/// The variants mirror [`ColumnType`]; `Null` is legal only in nullable
/// columns and the store enforces that on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum CellValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Text(String),
    Null,
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// The column type this value inhabits, `None` for null
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            CellValue::Integer(_) => Some(ColumnType::Integer),
            CellValue::Float(_) => Some(ColumnType::Float),
            CellValue::Boolean(_) => Some(ColumnType::Boolean),
            CellValue::Timestamp(_) => Some(ColumnType::Timestamp),
            CellValue::Text(_) => Some(ColumnType::Text),
            CellValue::Null => None,
        }
    }

    /// Whether the value can be stored in a column of `column_type`
    pub fn fits(&self, column_type: ColumnType) -> bool {
        self.column_type().is_none_or(|t| t == column_type)
    }

    /// Canonical text rendering used for content-hash row identities.
    /// Deterministic: the same value always renders the same way.
    pub fn canonical(&self) -> String {
        match self {
            CellValue::Integer(v) => v.to_string(),
            CellValue::Float(v) => format!("{:?}", v),
            CellValue::Boolean(v) => v.to_string(),
            CellValue::Timestamp(v) => v.to_rfc3339(),
            CellValue::Text(v) => v.clone(),
            CellValue::Null => "\u{0}null".to_string(),
        }
    }
}

impl std::fmt::Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Null => write!(f, "null"),
            other => write!(f, "{}", other.canonical()),
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Integer(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Boolean(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits() {
        assert!(CellValue::Integer(7).fits(ColumnType::Integer));
        assert!(!CellValue::Integer(7).fits(ColumnType::Text));
        assert!(CellValue::Null.fits(ColumnType::Integer));
    }

    #[test]
    fn test_canonical_is_stable() {
        assert_eq!(CellValue::Integer(42).canonical(), "42");
        assert_eq!(CellValue::from("abc").canonical(), "abc");
        // Null is distinguishable from the literal string "null"
        assert_ne!(CellValue::Null.canonical(), CellValue::from("null").canonical());
    }

    #[test]
    fn test_serde_roundtrip() {
        let v = CellValue::Float(1.5);
        let json = serde_json::to_string(&v).unwrap();
        let back: CellValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
