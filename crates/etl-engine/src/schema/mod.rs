//! Schema reconciliation
//!
//! Runs once per run, before the first slice is written, and brings the
//! destination table in line with the job's expected columns. What "in line"
//! means depends on the load strategy, see [`SchemaPolicy`]. Audit columns
//! (`created_at`, `updated_at`) never take part in the comparison.

pub mod ddl;
pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use etl_common::identifier::{quote_ident, quoted_list};

use crate::batch::{DataType, TabularBatch};
use crate::destination::{is_audit_column, Destination, SchemaSnapshot, TableRef};
use crate::error::{EngineError, Result};
use crate::models::{JobDefinition, LoadStrategy};

pub use ddl::DdlGenerator;
pub use types::{NativeFamily, TypeRegistry};

/// How an existing table is brought in line with the expected columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPolicy {
    /// Add missing columns, tolerate extra ones
    AutoAdd,
    /// Any difference is an error; upsert keys need a covering constraint
    StrictMatch,
    /// Recreate the table on any difference, otherwise truncate it
    DropRecreate,
}

impl From<LoadStrategy> for SchemaPolicy {
    fn from(strategy: LoadStrategy) -> Self {
        match strategy {
            LoadStrategy::Insert => SchemaPolicy::AutoAdd,
            LoadStrategy::Upsert => SchemaPolicy::StrictMatch,
            LoadStrategy::TruncateInsert => SchemaPolicy::DropRecreate,
        }
    }
}

/// One column the job writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedColumn {
    pub name: String,
    pub data_type: DataType,
    pub is_primary_key: bool,
}

impl ExpectedColumn {
    pub fn from_job(job: &JobDefinition) -> Vec<ExpectedColumn> {
        job.active_mappings()
            .into_iter()
            .filter(|m| !is_audit_column(&m.destination_column))
            .map(|m| ExpectedColumn {
                name: m.destination_column.clone(),
                data_type: m.destination_type,
                is_primary_key: m.is_primary_key,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaAction {
    Created,
    Unchanged,
    ColumnsAdded(Vec<String>),
    Truncated,
    Recreated,
}

/// Outcome of reconciliation, carried into the load stage
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub table: TableRef,
    pub policy: SchemaPolicy,
    pub action: SchemaAction,
    /// Table columns after every change made here
    pub snapshot: SchemaSnapshot,
    /// The table existed before this run touched it
    pub existed: bool,
    /// Table columns the job does not write (auto-add only)
    pub extra_columns: Vec<String>,
    pub primary_key_provisioned: bool,
}

pub struct SchemaReconciler {
    types: Arc<TypeRegistry>,
}

impl SchemaReconciler {
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self { types }
    }

    pub async fn reconcile(
        &self,
        destination: &mut dyn Destination,
        expected: &[ExpectedColumn],
        strategy: LoadStrategy,
        upsert_keys: &[String],
        create_ddl: Option<&str>,
    ) -> Result<Reconciliation> {
        let table = destination.table().clone();
        let policy = SchemaPolicy::from(strategy);

        let (snapshot, existed) = match destination.describe().await? {
            Some(snapshot) => (snapshot, true),
            None => {
                info!(table = %table, "Destination table does not exist, creating it");
                (create_table(destination, &table, create_ddl).await?, false)
            },
        };

        let diff = ColumnDiff::between(expected, &snapshot);
        let mut outcome = Reconciliation {
            table: table.clone(),
            policy,
            action: if existed { SchemaAction::Unchanged } else { SchemaAction::Created },
            snapshot,
            existed,
            extra_columns: Vec::new(),
            primary_key_provisioned: false,
        };

        match policy {
            SchemaPolicy::AutoAdd => self.auto_add(destination, &mut outcome, diff).await?,
            SchemaPolicy::StrictMatch => {
                if !diff.is_match() {
                    return Err(EngineError::SchemaMismatchForUpsert {
                        table: table.qualified(),
                        missing: diff.missing.iter().map(|c| c.name.clone()).collect(),
                        extra: diff.extra,
                    });
                }
                outcome.primary_key_provisioned =
                    ensure_upsert_constraint(destination, &table, expected, upsert_keys).await?;
            },
            SchemaPolicy::DropRecreate => {
                drop_recreate_or_truncate(destination, &mut outcome, &diff, create_ddl).await?
            },
        }

        info!(
            table = %table,
            policy = ?outcome.policy,
            action = ?outcome.action,
            "Schema reconciled"
        );
        Ok(outcome)
    }

    async fn auto_add(
        &self,
        destination: &mut dyn Destination,
        outcome: &mut Reconciliation,
        diff: ColumnDiff,
    ) -> Result<()> {
        if !diff.extra.is_empty() {
            info!(
                table = %outcome.table,
                columns = ?diff.extra,
                "Table has columns the job does not write; they stay null"
            );
        }
        outcome.extra_columns = diff.extra;

        if diff.missing.is_empty() {
            return Ok(());
        }

        let mut missing = diff.missing;
        missing.sort_by(|a, b| a.name.cmp(&b.name));

        let mut added = Vec::with_capacity(missing.len());
        for column in missing {
            let native = self.types.ddl_type(column.data_type);
            destination
                .add_column(&column.name, native)
                .await
                .map_err(|e| EngineError::SchemaAlterFailed {
                    table: outcome.table.qualified(),
                    message: format!("adding column {} {}: {}", quote_ident(&column.name), native, e),
                })?;
            info!(table = %outcome.table, column = %column.name, native_type = %native, "Added missing column");
            added.push(column.name);
        }

        outcome.snapshot = refreshed(destination, &outcome.table).await?;
        if outcome.existed {
            outcome.action = SchemaAction::ColumnsAdded(added);
        }
        Ok(())
    }
}

/// Expected columns missing from the table, and table columns not expected
struct ColumnDiff {
    missing: Vec<ExpectedColumn>,
    extra: Vec<String>,
}

impl ColumnDiff {
    fn between(expected: &[ExpectedColumn], snapshot: &SchemaSnapshot) -> Self {
        let expected_names: HashSet<&str> = expected.iter().map(|c| c.name.as_str()).collect();
        let missing = expected
            .iter()
            .filter(|c| !snapshot.has_column(&c.name))
            .cloned()
            .collect();
        let mut extra: Vec<String> = snapshot
            .business_columns()
            .into_iter()
            .filter(|n| !expected_names.contains(n))
            .map(str::to_string)
            .collect();
        extra.sort();
        Self { missing, extra }
    }

    fn is_match(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

async fn create_table(
    destination: &mut dyn Destination,
    table: &TableRef,
    create_ddl: Option<&str>,
) -> Result<SchemaSnapshot> {
    let ddl = create_ddl.ok_or_else(|| EngineError::NoDDLAvailable {
        table: table.qualified(),
    })?;
    destination
        .execute_ddl(ddl)
        .await
        .map_err(|e| EngineError::SchemaAlterFailed {
            table: table.qualified(),
            message: format!("executing table DDL: {}", e),
        })?;
    refreshed(destination, table).await
}

async fn refreshed(destination: &mut dyn Destination, table: &TableRef) -> Result<SchemaSnapshot> {
    destination
        .describe()
        .await?
        .ok_or_else(|| EngineError::SchemaAlterFailed {
            table: table.qualified(),
            message: "table does not exist after executing its DDL; check that the DDL creates \
                      this schema and table"
                .to_string(),
        })
}

async fn drop_recreate_or_truncate(
    destination: &mut dyn Destination,
    outcome: &mut Reconciliation,
    diff: &ColumnDiff,
    create_ddl: Option<&str>,
) -> Result<()> {
    let table = outcome.table.clone();

    if diff.is_match() {
        if outcome.existed {
            destination.truncate().await.map_err(|e| EngineError::SchemaAlterFailed {
                table: table.qualified(),
                message: format!("truncate failed: {}", e),
            })?;
            outcome.action = SchemaAction::Truncated;
            info!(table = %table, "Truncated destination table");
        }
        return Ok(());
    }

    if !outcome.existed {
        // freshly created from the job's own DDL and still different
        return Err(EngineError::SchemaAlterFailed {
            table: table.qualified(),
            message: format!(
                "table DDL does not produce the job's columns (missing [{}], unexpected [{}])",
                diff.missing.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", "),
                diff.extra.join(", ")
            ),
        });
    }

    // Checked before dropping so a missing DDL never leaves the table gone
    let ddl = create_ddl.ok_or_else(|| EngineError::NoDDLAvailable {
        table: table.qualified(),
    })?;

    warn!(
        table = %table,
        missing = ?diff.missing.iter().map(|c| &c.name).collect::<Vec<_>>(),
        extra = ?diff.extra,
        "Table columns differ from the job, dropping and recreating"
    );
    destination.drop_table().await.map_err(|e| EngineError::SchemaAlterFailed {
        table: table.qualified(),
        message: format!("drop failed: {}", e),
    })?;
    outcome.snapshot = create_table(destination, &table, Some(ddl)).await?;
    outcome.action = SchemaAction::Recreated;
    Ok(())
}

/// Make sure a PRIMARY KEY or UNIQUE constraint covers exactly the upsert
/// keys. Returns true when a primary key had to be provisioned.
async fn ensure_upsert_constraint(
    destination: &mut dyn Destination,
    table: &TableRef,
    expected: &[ExpectedColumn],
    upsert_keys: &[String],
) -> Result<bool> {
    let constraints = destination.unique_constraints().await?;
    if let Some(found) = constraints.iter().find(|c| c.covers_exactly(upsert_keys)) {
        info!(table = %table, constraint = %found.name, "Upsert keys are covered by a constraint");
        return Ok(false);
    }

    let existing_pk = constraints.iter().find(|c| c.is_primary);
    let remediation = remediation_ddl(table, existing_pk.map(|c| c.name.as_str()), upsert_keys);

    let declared = upsert_keys.iter().all(|key| {
        expected
            .iter()
            .any(|c| &c.name == key && c.is_primary_key)
    });
    if !declared {
        return Err(EngineError::MissingUpsertConstraint {
            table: table.qualified(),
            columns: upsert_keys.to_vec(),
            reason: "The upsert keys are not all declared as primary key columns, so no primary \
                     key was created automatically"
                .to_string(),
            remediation,
        });
    }

    info!(
        table = %table,
        keys = ?upsert_keys,
        replaced = existing_pk.map(|c| c.name.as_str()).unwrap_or("none"),
        "No constraint covers the upsert keys, adding a primary key"
    );
    match destination.replace_primary_key(upsert_keys).await {
        Ok(()) => Ok(true),
        Err(e) => Err(EngineError::MissingUpsertConstraint {
            table: table.qualified(),
            columns: upsert_keys.to_vec(),
            reason: format!("Adding the primary key failed: {}", e),
            remediation,
        }),
    }
}

fn remediation_ddl(table: &TableRef, existing_pk: Option<&str>, keys: &[String]) -> String {
    let qualified = table.qualified();
    let add = format!("ALTER TABLE {} ADD PRIMARY KEY ({});", qualified, quoted_list(keys));
    match existing_pk {
        Some(name) => format!(
            "ALTER TABLE {} DROP CONSTRAINT {}; {}",
            qualified,
            quote_ident(name),
            add
        ),
        None => add,
    }
}

/// Convert every batch column to the family of the table's native column
/// type. Any cell that does not convert fails the run.
pub fn coerce_to_native(
    mut batch: TabularBatch,
    reconciliation: &Reconciliation,
    types: &TypeRegistry,
) -> Result<TabularBatch> {
    let names: Vec<String> = batch.column_names().into_iter().map(str::to_string).collect();
    for name in names {
        let Some(native) = reconciliation.snapshot.native_type(&name) else {
            continue;
        };
        let target = types.family(native).data_type();
        let Some(column) = batch.column(&name) else {
            continue;
        };
        if column.data_type == target {
            continue;
        }
        let converted =
            column
                .coerce_to(target)
                .map_err(|message| EngineError::ColumnTypeConversionFailed {
                    table: reconciliation.table.qualified(),
                    column: name.clone(),
                    native_type: native.to_string(),
                    message,
                })?;
        batch.set_column(converted)?;
    }
    Ok(batch)
}
