//! Transformer - per-source row rules
//!
//! Consumes row batches and applies the source's declared rule list in
//! order, so later rules can see columns earlier rules produced. Rules are
//! deterministic pure functions of one row. A rule that fails on a row
//! skips and logs that row; three consecutive failing rows escalate to
//! dead-lettering the whole batch rather than silently dropping most of it.

use crate::bus_client::SharedBusClient;
use crate::config::TransformerSettings;
use crate::error::{StageError, StageResult};
use crate::events::{PipelineEvent, PipelineMessage, RowRecord};
use crate::runner::{Outcome, Stage};
use crate::stages::inference::coerce_value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use silo_registry::{ColumnDef, ColumnType, MetadataRegistry};
use silo_store::CellValue;
use std::sync::Arc;
use tracing::{info, warn};

/// Consecutive per-row failures that poison the whole batch
const MAX_CONSECUTIVE_ROW_FAILURES: u32 = 3;

/// One transformation step. The tagged-variant representation keeps the
/// Transformer's core loop closed: new rule kinds are new variants, not new
/// dispatch sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformRule {
    /// Rename a column
    Rename { from: String, to: String },

    /// Cast a column to another type; rows whose value cannot cast are
    /// skipped
    Cast { column: String, to: ColumnType },

    /// Append a derived column computed from the row
    Derive { column: String, expr: DeriveExpr },

    /// Drop a column
    Drop { column: String },
}

/// Deterministic row expressions for derived columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum DeriveExpr {
    /// Join the text renderings of the given columns; null inputs yield null
    Concat {
        columns: Vec<String>,
        #[serde(default = "default_separator")]
        separator: String,
    },

    /// Multiply a numeric column by a constant factor; yields a float
    Scale { column: String, factor: f64 },

    /// A constant text value
    Constant { value: String },
}

fn default_separator() -> String {
    "-".to_string()
}

impl DeriveExpr {
    /// Output column definition for this expression
    fn output(&self, column: &str) -> ColumnDef {
        match self {
            DeriveExpr::Concat { .. } | DeriveExpr::Scale { .. } => {
                ColumnDef::nullable(column, self.output_type())
            }
            DeriveExpr::Constant { .. } => ColumnDef::required(column, self.output_type()),
        }
    }

    fn output_type(&self) -> ColumnType {
        match self {
            DeriveExpr::Concat { .. } | DeriveExpr::Constant { .. } => ColumnType::Text,
            DeriveExpr::Scale { .. } => ColumnType::Float,
        }
    }
}

/// A compiled rule list: the output column shape is fixed up front, rows
/// are then mapped one at a time.
pub struct RuleSet<'a> {
    rules: &'a [TransformRule],
}

impl<'a> RuleSet<'a> {
    pub fn new(rules: &'a [TransformRule]) -> Self {
        Self { rules }
    }

    /// Compute the output column list. Fails when a rule references a
    /// column that does not exist at its point in the chain; that is a
    /// configuration error, not a data error.
    pub fn output_columns(&self, input: &[ColumnDef]) -> StageResult<Vec<ColumnDef>> {
        let mut columns = input.to_vec();
        for rule in self.rules {
            match rule {
                TransformRule::Rename { from, to } => {
                    let column = find_mut(&mut columns, from)?;
                    column.name = to.clone();
                }
                TransformRule::Cast { column, to } => {
                    let column = find_mut(&mut columns, column)?;
                    column.column_type = *to;
                }
                TransformRule::Derive { column, expr } => {
                    if columns.iter().any(|c| &c.name == column) {
                        return Err(StageError::config(format!(
                            "derive target '{}' already exists",
                            column
                        )));
                    }
                    // Expression inputs must exist
                    match expr {
                        DeriveExpr::Concat { columns: inputs, .. } => {
                            for input in inputs {
                                find_mut(&mut columns, input)?;
                            }
                        }
                        DeriveExpr::Scale { column: input, .. } => {
                            let input = find_mut(&mut columns, input)?;
                            if !matches!(
                                input.column_type,
                                ColumnType::Integer | ColumnType::Float
                            ) {
                                return Err(StageError::config(format!(
                                    "scale input '{}' is {}, not numeric",
                                    input.name, input.column_type
                                )));
                            }
                        }
                        DeriveExpr::Constant { .. } => {}
                    }
                    columns.push(expr.output(column));
                }
                TransformRule::Drop { column } => {
                    find_mut(&mut columns, column)?;
                    columns.retain(|c| &c.name != column);
                }
            }
        }
        Ok(columns)
    }

    /// Apply the rule chain to one row. The row is keyed by the *input*
    /// column list; the result is ordered per [`RuleSet::output_columns`].
    pub fn apply_row(
        &self,
        input: &[ColumnDef],
        row: &RowRecord,
    ) -> Result<Vec<CellValue>, String> {
        // Working set: (column name, current type, value)
        let mut cells: Vec<(String, ColumnType, CellValue)> = input
            .iter()
            .zip(&row.values)
            .map(|(c, v)| (c.name.clone(), c.column_type, v.clone()))
            .collect();

        for rule in self.rules {
            match rule {
                TransformRule::Rename { from, to } => {
                    let cell = cells
                        .iter_mut()
                        .find(|(name, _, _)| name == from)
                        .ok_or_else(|| format!("unknown column '{}'", from))?;
                    cell.0 = to.clone();
                }
                TransformRule::Cast { column, to } => {
                    let cell = cells
                        .iter_mut()
                        .find(|(name, _, _)| name == column)
                        .ok_or_else(|| format!("unknown column '{}'", column))?;
                    cell.2 = cast_value(&cell.2, *to)?;
                    cell.1 = *to;
                }
                TransformRule::Derive { column, expr } => {
                    let value = evaluate(expr, &cells)?;
                    cells.push((column.clone(), expr.output_type(), value));
                }
                TransformRule::Drop { column } => {
                    cells.retain(|(name, _, _)| name != column);
                }
            }
        }

        Ok(cells.into_iter().map(|(_, _, value)| value).collect())
    }
}

fn find_mut<'c>(columns: &'c mut [ColumnDef], name: &str) -> StageResult<&'c mut ColumnDef> {
    columns
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| StageError::config(format!("rule references unknown column '{}'", name)))
}

/// Cast one value to a target type. Same-type casts are identity; null
/// stays null; everything else goes through the canonical text rendering
/// and the coercion rules.
fn cast_value(value: &CellValue, to: ColumnType) -> Result<CellValue, String> {
    if value.is_null() || value.fits(to) {
        return Ok(value.clone());
    }
    coerce_value(&value.canonical(), &ColumnDef::nullable("cast", to))
}

fn evaluate(
    expr: &DeriveExpr,
    cells: &[(String, ColumnType, CellValue)],
) -> Result<CellValue, String> {
    let lookup = |name: &str| -> Result<&CellValue, String> {
        cells
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, v)| v)
            .ok_or_else(|| format!("unknown column '{}'", name))
    };

    match expr {
        DeriveExpr::Concat { columns, separator } => {
            let mut parts = Vec::with_capacity(columns.len());
            for column in columns {
                let value = lookup(column)?;
                if value.is_null() {
                    return Ok(CellValue::Null);
                }
                parts.push(value.canonical());
            }
            Ok(CellValue::Text(parts.join(separator)))
        }
        DeriveExpr::Scale { column, factor } => match lookup(column)? {
            CellValue::Integer(v) => Ok(CellValue::Float(*v as f64 * factor)),
            CellValue::Float(v) => Ok(CellValue::Float(v * factor)),
            CellValue::Null => Ok(CellValue::Null),
            other => Err(format!(
                "scale input '{}' is not numeric: {}",
                column, other
            )),
        },
        DeriveExpr::Constant { value } => Ok(CellValue::Text(value.clone())),
    }
}

pub struct Transformer {
    bus: SharedBusClient,
    registry: Arc<MetadataRegistry>,
    settings: TransformerSettings,
    transformed_topic: String,
}

impl Transformer {
    pub fn new(
        bus: SharedBusClient,
        registry: Arc<MetadataRegistry>,
        settings: TransformerSettings,
        transformed_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            registry,
            settings,
            transformed_topic: transformed_topic.into(),
        }
    }

    async fn rules_for(&self, source_id: silo_registry::SourceId) -> StageResult<Vec<TransformRule>> {
        let source = self.registry.get_source(source_id).await?;
        Ok(self
            .settings
            .rules
            .get(&source.name)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl Stage for Transformer {
    fn name(&self) -> &'static str {
        "transformer"
    }

    async fn process(&self, message: &PipelineMessage) -> StageResult<Outcome> {
        let PipelineEvent::RowBatch { columns, rows } = &message.event else {
            return Err(StageError::fatal(format!(
                "unexpected event '{}' on rows topic",
                message.event.kind()
            )));
        };

        let rules = self.rules_for(message.source_id).await?;
        let rule_set = RuleSet::new(&rules);
        let output_columns = rule_set.output_columns(columns)?;

        let mut transformed = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        let mut consecutive_failures = 0u32;

        for (index, row) in rows.iter().enumerate() {
            match rule_set.apply_row(columns, row) {
                Ok(values) => {
                    consecutive_failures = 0;
                    transformed.push(RowRecord::new(values));
                }
                Err(reason) => {
                    skipped += 1;
                    consecutive_failures += 1;
                    warn!(
                        source_id = %message.source_id,
                        sequence = message.sequence,
                        row = index,
                        reason,
                        "Rule failed, skipping row"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_ROW_FAILURES {
                        return Err(StageError::fatal(format!(
                            "{} consecutive rule failures in batch (last: {})",
                            consecutive_failures, reason
                        )));
                    }
                }
            }
        }

        let out = PipelineMessage::new(
            message.source_id,
            message.sequence,
            PipelineEvent::TransformedBatch {
                columns: output_columns,
                rows: transformed,
            },
        );
        let out = match message.schema_version {
            Some(version) => out.with_schema_version(version),
            None => out,
        };
        self.bus.publish(&self.transformed_topic, &out).await?;

        if skipped > 0 {
            info!(
                source_id = %message.source_id,
                sequence = message.sequence,
                skipped,
                "Batch transformed with skipped rows"
            );
        }
        Ok(Outcome::Committed)
    }
}
