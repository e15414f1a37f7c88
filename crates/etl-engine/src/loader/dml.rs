//! Insert and upsert statements for PostgreSQL-protocol destinations

use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};

use etl_common::identifier::{quote_ident, quoted_list};

use super::{PlannedColumn, WritePlan};
use crate::batch::{TabularBatch, Value};
use crate::destination::UPDATED_AT;
use crate::models::LoadStrategy;

/// Bind parameters PostgreSQL accepts in one statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Rows that fit into one statement for a slice of `columns` columns
pub fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

/// `[start, end)` row ranges covering `rows`, one per statement
pub fn statement_ranges(rows: usize, columns: usize) -> Vec<(usize, usize)> {
    let step = rows_per_statement(columns);
    (0..rows)
        .step_by(step)
        .map(|start| (start, (start + step).min(rows)))
        .collect()
}

/// Multi-row INSERT (or upsert) for rows `[start, end)` of `slice`.
///
/// Every value is bound and cast to the column's native type, so the text of
/// the statement never contains data.
pub fn build_write(
    plan: &WritePlan,
    slice: &TabularBatch,
    start: usize,
    end: usize,
) -> QueryBuilder<'static, Postgres> {
    let names = plan.column_names();
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} AS tgt ({}) ",
        plan.table.qualified(),
        quoted_list(&names)
    ));

    qb.push_values(start..end, |mut row, idx| {
        for (column, planned) in slice.columns().iter().zip(&plan.columns) {
            push_typed(&mut row, &column.values[idx], planned);
        }
    });

    if plan.strategy == LoadStrategy::Upsert {
        qb.push(upsert_clause(plan));
    }
    qb
}

fn push_typed(
    row: &mut Separated<'_, 'static, Postgres, &'static str>,
    value: &Value,
    column: &PlannedColumn,
) {
    match value {
        Value::Null => row.push_bind(None::<String>),
        Value::Text(s) => row.push_bind(s.clone()),
        Value::Integer(i) => row.push_bind(*i),
        Value::Numeric(f) => row.push_bind(*f),
        Value::Boolean(b) => row.push_bind(*b),
        Value::Timestamp(ts) => row.push_bind(*ts),
    };
    row.push_unseparated(format!("::{}", column.native_type));
}

/// `ON CONFLICT` tail of an upsert.
///
/// The update touches every non-key column except `created_at`, bumps
/// `updated_at` to the write time, and only fires when at least one compared
/// column is distinct from the stored row (null vs null counts as equal).
pub fn upsert_clause(plan: &WritePlan) -> String {
    let mut sql = format!(" ON CONFLICT ({}) DO ", quoted_list(&plan.upsert_keys));
    let updates = plan.update_columns();
    if updates.is_empty() {
        sql.push_str("NOTHING");
        return sql;
    }

    let mut assignments: Vec<String> = updates
        .iter()
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();
    if plan.has_updated_at {
        assignments.push(format!("{} = NOW()", quote_ident(UPDATED_AT)));
    }

    let stored: Vec<String> = updates.iter().map(|c| format!("tgt.{}", quote_ident(c))).collect();
    let incoming: Vec<String> = updates
        .iter()
        .map(|c| format!("EXCLUDED.{}", quote_ident(c)))
        .collect();

    sql.push_str(&format!(
        "UPDATE SET {} WHERE ({}) IS DISTINCT FROM ({})",
        assignments.join(", "),
        stored.join(", "),
        incoming.join(", ")
    ));
    sql
}
