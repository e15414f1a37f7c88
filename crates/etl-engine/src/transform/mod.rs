//! Transform engine
//!
//! Turns the source batch into the destination-shaped batch, one mapping at a
//! time in mapping `order`:
//!
//! 1. calculated columns are evaluated by the sandboxed [`expr`] interpreter
//!    against the columns produced so far, then the source columns
//! 2. other columns are copied from the source and run through their named
//!    transformations
//! 3. the result is coerced to the destination type (best effort: a failure is
//!    logged and the column keeps its values)
//! 4. nulls are replaced by the default value of non-nullable columns
//!
//! Excluded mappings never reach the destination batch.

pub mod expr;
pub mod registry;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::batch::{Column, DataType, TabularBatch, Value};
use crate::error::{EngineError, Result};
use crate::models::ColumnMapping;

pub use expr::{ExprError, Expression, Scope};
pub use registry::{TransformCategory, TransformFn, TransformRegistry, TransformSpec};

/// Identifier lookup for calculated columns: produced columns shadow source
/// columns of the same name.
struct BatchScope<'a> {
    produced: &'a TabularBatch,
    source: &'a TabularBatch,
}

impl Scope for BatchScope<'_> {
    fn lookup(&self, name: &str) -> Option<&[Value]> {
        self.produced
            .column(name)
            .or_else(|| self.source.column(name))
            .map(|c| c.values.as_slice())
    }
}

#[derive(Debug, Clone)]
pub struct TransformEngine {
    registry: Arc<TransformRegistry>,
}

impl TransformEngine {
    pub fn new(registry: Arc<TransformRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    /// Check transformation names and expression syntax without data.
    pub fn validate_mappings(&self, mappings: &[ColumnMapping]) -> Result<()> {
        for mapping in mappings.iter().filter(|m| !m.exclude) {
            if let Some(src) = &mapping.calculated_expression {
                Expression::parse(src).map_err(|e| {
                    EngineError::expression(&mapping.destination_column, e.to_string())
                })?;
            } else {
                for name in &mapping.transformations {
                    self.registry.check(name)?;
                }
            }
        }
        Ok(())
    }

    pub fn transform(&self, source: &TabularBatch, mappings: &[ColumnMapping]) -> Result<TabularBatch> {
        let rows = source.row_count();
        let mut active: Vec<&ColumnMapping> = mappings.iter().filter(|m| !m.exclude).collect();
        active.sort_by_key(|m| m.order);

        let mut produced = TabularBatch::new();
        for mapping in active {
            let column = match &mapping.calculated_expression {
                Some(src) => self.calculate(mapping, src, &produced, source, rows)?,
                None => self.map_source(mapping, source)?,
            };
            let column = coerce_best_effort(column, mapping.destination_type);
            let column = apply_default(column, mapping);
            produced.push_column(column)?;
        }

        info!(
            input_columns = source.column_count(),
            output_columns = produced.column_count(),
            rows = rows,
            "Transformations complete"
        );
        Ok(produced)
    }

    fn calculate(
        &self,
        mapping: &ColumnMapping,
        src: &str,
        produced: &TabularBatch,
        source: &TabularBatch,
        rows: usize,
    ) -> Result<Column> {
        let dest = &mapping.destination_column;
        let expression =
            Expression::parse(src).map_err(|e| EngineError::expression(dest, e.to_string()))?;
        let scope = BatchScope { produced, source };
        let (data_type, values) = expression
            .evaluate(&scope, rows)
            .map_err(|e| EngineError::expression(dest, e.to_string()))?;

        debug!(column = %dest, expression = %src, "Calculated column");
        Ok(Column::new(
            dest.clone(),
            data_type.unwrap_or(mapping.destination_type),
            values,
        ))
    }

    fn map_source(&self, mapping: &ColumnMapping, source: &TabularBatch) -> Result<Column> {
        let name = mapping.source_column.as_deref().unwrap_or_default();
        let column = source
            .column(name)
            .ok_or_else(|| EngineError::SourceColumnMissing {
                column: name.to_string(),
                available: source.column_names().join(", "),
            })?;

        let column = restore_source_text(column, mapping.destination_type);
        let mut column = self.registry.apply_all(column, &mapping.transformations)?;
        if !mapping.transformations.is_empty() {
            debug!(
                source_column = %name,
                transformations = ?mapping.transformations,
                "Applied transformations"
            );
        }
        column.name = mapping.destination_column.clone();
        Ok(column)
    }
}

/// A boolean column bound for a text destination goes back to its source
/// tokens before any transformation sees it.
fn restore_source_text(column: &Column, target: DataType) -> Column {
    if target == DataType::Text
        && column.data_type == DataType::Boolean
        && column.source_text().is_some()
    {
        if let Ok(text) = column.coerce_to(DataType::Text) {
            return text;
        }
    }
    column.clone()
}

/// Coerce a column, or warn and keep its current values.
fn coerce_best_effort(column: Column, target: DataType) -> Column {
    if column.data_type == target {
        return column;
    }
    match column.coerce_to(target) {
        Ok(coerced) => coerced,
        Err(e) => {
            warn!(
                column = %column.name,
                from_type = %column.data_type,
                target_type = %target,
                error = %e,
                "Type conversion failed, continuing with original type"
            );
            column
        },
    }
}

fn apply_default(mut column: Column, mapping: &ColumnMapping) -> Column {
    let default = match mapping.default_value.as_deref() {
        Some(d) if !mapping.is_nullable && !d.is_empty() => d,
        _ => return column,
    };
    if column.null_count() == 0 {
        return column;
    }

    let value = match Value::Text(default.to_string()).coerce(column.data_type) {
        Ok(v) if !v.is_null() => v,
        Ok(_) | Err(_) => {
            warn!(
                column = %column.name,
                default = %default,
                column_type = %column.data_type,
                "Default value does not fit the column type, nulls left in place"
            );
            return column;
        },
    };

    for cell in column.values.iter_mut().filter(|v| v.is_null()) {
        *cell = value.clone();
    }
    column
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn engine() -> TransformEngine {
        TransformEngine::new(Arc::new(TransformRegistry::builtin()))
    }

    fn source() -> TabularBatch {
        TabularBatch::from_columns(vec![
            Column::new(
                "id",
                DataType::Integer,
                vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)],
            ),
            Column::new(
                "name",
                DataType::Text,
                vec![
                    Value::Text(" ada ".into()),
                    Value::Text("grace".into()),
                    Value::Null,
                ],
            ),
            Column::new(
                "amt",
                DataType::Text,
                vec![
                    Value::Text("1.5".into()),
                    Value::Text("2".into()),
                    Value::Text("x".into()),
                ],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_rename_exclude_and_order() {
        let mappings = vec![
            ColumnMapping::new("name", "full_name", DataType::Text).with_order(2),
            ColumnMapping::new("id", "id", DataType::Integer).with_order(1),
            ColumnMapping::new("amt", "amt", DataType::Numeric).excluded(),
        ];
        let out = engine().transform(&source(), &mappings).unwrap();
        assert_eq!(out.column_names(), vec!["id", "full_name"]);
        assert_eq!(out.row_count(), 3);
    }

    #[test]
    fn test_transformations_then_default() {
        let mappings = vec![ColumnMapping::new("name", "name", DataType::Text)
            .with_transformations(&["TRIM", "UPPER"])
            .not_null_with_default("UNKNOWN")];
        let out = engine().transform(&source(), &mappings).unwrap();
        assert_eq!(
            out.column("name").unwrap().values,
            vec![
                Value::Text("ADA".into()),
                Value::Text("GRACE".into()),
                Value::Text("UNKNOWN".into())
            ]
        );
    }

    #[test]
    fn test_default_ignored_for_nullable() {
        let mut mapping = ColumnMapping::new("name", "name", DataType::Text);
        mapping.default_value = Some("n/a".into());
        let out = engine().transform(&source(), &[mapping]).unwrap();
        assert_eq!(out.column("name").unwrap().values[2], Value::Null);
    }

    #[test]
    fn test_failed_coercion_keeps_values() {
        let mappings = vec![ColumnMapping::new("amt", "amt", DataType::Numeric)];
        let out = engine().transform(&source(), &mappings).unwrap();
        let amt = out.column("amt").unwrap();
        assert_eq!(amt.data_type, DataType::Text);
        assert_eq!(amt.values[2], Value::Text("x".into()));
    }

    #[test]
    fn test_boolean_tokens_survive_text_destinations() {
        let source = crate::source::parse_csv(b"id,answer,code\n1,Yes,1\n2,No,0\n3,,1\n").unwrap();
        assert_eq!(source.column("answer").unwrap().data_type, DataType::Boolean);

        let mappings = vec![
            ColumnMapping::new("answer", "answer", DataType::Text),
            ColumnMapping::new("code", "code", DataType::Text).with_order(1),
            ColumnMapping::new("answer", "shout", DataType::Text)
                .with_transformations(&["UPPER"])
                .with_order(2),
            ColumnMapping::new("code", "flag", DataType::Boolean).with_order(3),
        ];
        let out = engine().transform(&source, &mappings).unwrap();

        assert_eq!(
            out.column("answer").unwrap().values,
            vec![Value::Text("Yes".into()), Value::Text("No".into()), Value::Null]
        );
        assert_eq!(
            out.column("code").unwrap().values,
            vec![Value::Text("1".into()), Value::Text("0".into()), Value::Text("1".into())]
        );
        assert_eq!(out.column("shout").unwrap().values[1], Value::Text("NO".into()));
        assert_eq!(out.column("flag").unwrap().values[1], Value::Boolean(false));
    }

    #[test]
    fn test_successful_coercion() {
        let mappings = vec![ColumnMapping::new("id", "id_text", DataType::Text)];
        let out = engine().transform(&source(), &mappings).unwrap();
        assert_eq!(out.column("id_text").unwrap().values[0], Value::Text("1".into()));
    }

    #[test]
    fn test_calculated_uses_produced_columns_first() {
        let mappings = vec![
            ColumnMapping::new("id", "id", DataType::Integer).with_transformations(&[]),
            // produced "doubled" then referenced by the next calculated column
            ColumnMapping::calculated("doubled", DataType::Integer, "id * 2").with_order(1),
            ColumnMapping::calculated("quad", DataType::Integer, "doubled * 2").with_order(2),
        ];
        let out = engine().transform(&source(), &mappings).unwrap();
        assert_eq!(
            out.column("quad").unwrap().values,
            vec![Value::Integer(4), Value::Integer(8), Value::Integer(12)]
        );
    }

    #[test]
    fn test_calculated_can_read_unmapped_source_columns() {
        let mappings = vec![ColumnMapping::calculated("label", DataType::Text, "str(id) + '-x'")];
        let out = engine().transform(&source(), &mappings).unwrap();
        assert_eq!(out.column("label").unwrap().values[0], Value::Text("1-x".into()));
    }

    #[test]
    fn test_expression_errors() {
        let err = engine()
            .transform(
                &source(),
                &[ColumnMapping::calculated("x", DataType::Integer, "nope + 1")],
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::ExpressionError { ref column, .. } if column == "x"));

        let err = engine()
            .transform(
                &source(),
                &[ColumnMapping::calculated("x", DataType::Integer, "id +")],
            )
            .unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn test_missing_source_column() {
        let err = engine()
            .transform(&source(), &[ColumnMapping::new("zip", "zip", DataType::Text)])
            .unwrap_err();
        match err {
            EngineError::SourceColumnMissing { column, available } => {
                assert_eq!(column, "zip");
                assert_eq!(available, "id, name, amt");
            },
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unknown_transformation() {
        let mappings = vec![ColumnMapping::new("name", "name", DataType::Text).with_transformations(&["SHOUT"])];
        assert!(matches!(
            engine().transform(&source(), &mappings),
            Err(EngineError::UnknownTransformation { .. })
        ));
        assert!(engine().validate_mappings(&mappings).is_err());
    }

    #[test]
    fn test_excluded_calculated_column_never_appears() {
        let mappings = vec![
            ColumnMapping::new("id", "id", DataType::Integer),
            ColumnMapping::calculated("bad", DataType::Integer, "undefined_thing").excluded(),
        ];
        let out = engine().transform(&source(), &mappings).unwrap();
        assert!(!out.has_column("bad"));
    }
}
