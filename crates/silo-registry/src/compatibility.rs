//! Schema compatibility checking
//!
//! Decides whether a proposed column list can evolve a source's schema
//! automatically. The contract is deliberately narrow: only the pure
//! addition of nullable columns is compatible. Everything else (removed
//! columns, retyped columns, widening included, nullability changes, new
//! required columns) is a conflict for manual review.

use crate::types::ColumnDef;
use serde::{Deserialize, Serialize};

/// Outcome of diffing a proposed column list against the current version
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDiff {
    /// Same columns, same types, same nullability
    Identical,
    /// Current columns untouched, only nullable columns added
    AddsNullable(Vec<ColumnDef>),
    /// Incompatible change; the reasons are operator-facing
    Breaking(Vec<String>),
}

/// Details of a rejected proposal, carried on dead-letter events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaConflict {
    /// Version the source stays on
    pub current_version: u32,
    pub reasons: Vec<String>,
    /// Whether the source was already frozen when the proposal arrived
    /// (true for every proposal after the one that caused the freeze)
    pub already_frozen: bool,
}

impl std::fmt::Display for SchemaConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "schema conflict against version {}: {}",
            self.current_version,
            self.reasons.join("; ")
        )
    }
}

/// Diff a proposed column list against the current one.
///
/// Columns are matched by name; the proposal's ordering of existing columns
/// is irrelevant (the current version's order stays authoritative), only the
/// set and definitions matter.
pub fn diff(current: &[ColumnDef], proposed: &[ColumnDef]) -> SchemaDiff {
    let mut reasons = Vec::new();
    let mut added = Vec::new();

    for column in current {
        match proposed.iter().find(|p| p.name == column.name) {
            None => reasons.push(format!("column '{}' removed", column.name)),
            Some(candidate) => {
                if candidate.column_type != column.column_type {
                    reasons.push(format!(
                        "column '{}' retyped {} -> {}",
                        column.name, column.column_type, candidate.column_type
                    ));
                }
                if candidate.nullable != column.nullable {
                    reasons.push(format!(
                        "column '{}' nullability changed ({} -> {})",
                        column.name,
                        nullability(column.nullable),
                        nullability(candidate.nullable)
                    ));
                }
            }
        }
    }

    for candidate in proposed {
        if current.iter().any(|c| c.name == candidate.name) {
            continue;
        }
        if candidate.nullable {
            added.push(candidate.clone());
        } else {
            reasons.push(format!(
                "new column '{}' is not nullable",
                candidate.name
            ));
        }
    }

    if !reasons.is_empty() {
        SchemaDiff::Breaking(reasons)
    } else if added.is_empty() {
        SchemaDiff::Identical
    } else {
        SchemaDiff::AddsNullable(added)
    }
}

fn nullability(nullable: bool) -> &'static str {
    if nullable {
        "nullable"
    } else {
        "required"
    }
}
