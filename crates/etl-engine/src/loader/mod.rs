//! Batch loader
//!
//! Writes the destination-shaped batch in row slices of `batch_size`, one
//! slice at a time and in source order. Each slice is atomic on the
//! destination side. The first failing slice aborts the load: its rows are
//! counted as failed, progress is reported, and the error is returned.

pub mod dml;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info};

use crate::batch::{Column, DataType, TabularBatch, Value};
use crate::destination::{Destination, SchemaSnapshot, TableRef, CREATED_AT, UPDATED_AT};
use crate::error::{EngineError, Result};
use crate::models::LoadStrategy;
use crate::schema::{NativeFamily, TypeRegistry};

/// One destination column of a write, with the type values are cast to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedColumn {
    pub name: String,
    pub native_type: String,
    pub family: NativeFamily,
}

/// Everything a destination needs to turn a slice into DML
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub table: TableRef,
    pub strategy: LoadStrategy,
    /// Written columns, in batch order
    pub columns: Vec<PlannedColumn>,
    pub upsert_keys: Vec<String>,
    pub has_created_at: bool,
    pub has_updated_at: bool,
}

impl WritePlan {
    pub fn new(
        table: TableRef,
        strategy: LoadStrategy,
        upsert_keys: &[String],
        batch: &TabularBatch,
        snapshot: &SchemaSnapshot,
        types: &TypeRegistry,
    ) -> Self {
        let columns = batch
            .columns()
            .iter()
            .map(|c| {
                let native_type = snapshot
                    .native_type(&c.name)
                    .unwrap_or_else(|| types.ddl_type(c.data_type))
                    .to_string();
                PlannedColumn {
                    family: types.family(&native_type),
                    name: c.name.clone(),
                    native_type,
                }
            })
            .collect();

        Self {
            table,
            strategy,
            columns,
            upsert_keys: upsert_keys.to_vec(),
            has_created_at: snapshot.has_column(CREATED_AT),
            has_updated_at: snapshot.has_column(UPDATED_AT),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns an upsert overwrites on conflict: everything but the keys and
    /// the audit columns.
    pub fn update_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|n| !self.upsert_keys.iter().any(|k| k == n))
            .filter(|n| *n != CREATED_AT && *n != UPDATED_AT)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub rows_processed: u64,
    pub rows_failed: u64,
    pub slices: usize,
}

/// Receives cumulative counts after every slice, before the next one starts
#[async_trait]
pub trait LoadProgress: Send {
    async fn slice_done(&mut self, rows_processed: u64, rows_failed: u64) -> Result<()>;
}

/// Ignores progress
pub struct NoProgress;

#[async_trait]
impl LoadProgress for NoProgress {
    async fn slice_done(&mut self, _rows_processed: u64, _rows_failed: u64) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Loader {
    batch_size: usize,
    types: Arc<TypeRegistry>,
}

impl Loader {
    pub fn new(batch_size: usize, types: Arc<TypeRegistry>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            types,
        }
    }

    /// Number of slices a batch of `rows` rows is written in
    pub fn slice_count(&self, rows: usize) -> usize {
        rows.div_ceil(self.batch_size)
    }

    /// Write `batch` into the table described by `snapshot`.
    pub async fn load(
        &self,
        destination: &mut dyn Destination,
        batch: TabularBatch,
        snapshot: &SchemaSnapshot,
        strategy: LoadStrategy,
        upsert_keys: &[String],
        progress: &mut dyn LoadProgress,
    ) -> Result<LoadSummary> {
        let batch = stamp_audit_columns(batch, strategy, snapshot)?;
        let plan = WritePlan::new(
            destination.table().clone(),
            strategy,
            upsert_keys,
            &batch,
            snapshot,
            &self.types,
        );

        let rows = batch.row_count();
        let mut summary = LoadSummary::default();
        info!(
            table = %plan.table,
            strategy = %plan.strategy,
            rows = rows,
            batch_size = self.batch_size,
            slices = self.slice_count(rows),
            "Loading batch"
        );

        for (index, start) in (0..rows).step_by(self.batch_size).enumerate() {
            let end = (start + self.batch_size).min(rows);
            let slice = batch.slice(start, end);
            let slice_rows = end - start;

            match destination.write_slice(&plan, &slice).await {
                Ok(_) => {
                    summary.rows_processed += slice_rows as u64;
                    summary.slices += 1;
                    debug!(table = %plan.table, slice = index + 1, rows = slice_rows, "Slice written");
                    progress
                        .slice_done(summary.rows_processed, summary.rows_failed)
                        .await?;
                },
                Err(e) => {
                    summary.rows_failed += slice_rows as u64;
                    error!(
                        table = %plan.table,
                        slice = index + 1,
                        rows = slice_rows,
                        error = %e,
                        "Slice failed"
                    );
                    // The slice failure is the cause to report, not the
                    // bookkeeping after it.
                    if let Err(persist) = progress
                        .slice_done(summary.rows_processed, summary.rows_failed)
                        .await
                    {
                        error!(
                            table = %plan.table,
                            slice = index + 1,
                            error = %persist,
                            "Failed to record progress of the failed slice"
                        );
                    }
                    return Err(EngineError::LoadFailed {
                        table: plan.table.qualified(),
                        slice: index + 1,
                        rows: slice_rows,
                        strategy: plan.strategy,
                        message: e.to_string(),
                    });
                },
            }
        }

        info!(
            table = %plan.table,
            rows_processed = summary.rows_processed,
            slices = summary.slices,
            "Load complete"
        );
        Ok(summary)
    }
}

/// For insert and truncate_insert, fill audit columns the table has but the
/// batch lacks with the write time. Upserts leave them to the DML.
pub fn stamp_audit_columns(
    mut batch: TabularBatch,
    strategy: LoadStrategy,
    snapshot: &SchemaSnapshot,
) -> Result<TabularBatch> {
    if strategy == LoadStrategy::Upsert {
        return Ok(batch);
    }
    let now = Utc::now().naive_utc();
    let rows = batch.row_count();
    for name in [CREATED_AT, UPDATED_AT] {
        if snapshot.has_column(name) && !batch.has_column(name) {
            let column = Column::new(name, DataType::Timestamp, vec![Value::Timestamp(now); rows]);
            batch.set_column(column)?;
        }
    }
    Ok(batch)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::destination::{ColumnInfo, DestinationConnector, MemoryConnector, MemoryTable};
    use crate::models::{DestinationConfig, DestinationKind};

    fn snapshot(names: &[(&str, &str)]) -> SchemaSnapshot {
        SchemaSnapshot::new(
            names
                .iter()
                .map(|(n, t)| ColumnInfo {
                    name: n.to_string(),
                    native_type: t.to_string(),
                    nullable: true,
                })
                .collect(),
        )
    }

    fn batch() -> TabularBatch {
        TabularBatch::from_columns(vec![
            Column::new("id", DataType::Integer, vec![Value::Integer(1)]),
            Column::new("v", DataType::Text, vec![Value::Text("a".into())]),
        ])
        .unwrap()
    }

    #[test]
    fn test_plan_uses_native_types() {
        let snap = snapshot(&[("id", "integer"), ("v", "character varying(10)"), (UPDATED_AT, "timestamp without time zone")]);
        let plan = WritePlan::new(
            TableRef::new("public", "t"),
            LoadStrategy::Upsert,
            &["id".to_string()],
            &batch(),
            &snap,
            &TypeRegistry::postgres(),
        );
        assert_eq!(plan.columns[1].native_type, "character varying(10)");
        assert_eq!(plan.columns[1].family, NativeFamily::Text);
        assert!(!plan.has_created_at);
        assert!(plan.has_updated_at);
        assert_eq!(plan.update_columns(), vec!["v"]);
    }

    #[test]
    fn test_stamping_only_for_inserts() {
        let snap = snapshot(&[("id", "integer"), ("v", "text"), (CREATED_AT, "timestamp"), (UPDATED_AT, "timestamp")]);

        let stamped = stamp_audit_columns(batch(), LoadStrategy::Insert, &snap).unwrap();
        assert_eq!(stamped.column_names(), vec!["id", "v", CREATED_AT, UPDATED_AT]);
        assert!(matches!(stamped.column(CREATED_AT).unwrap().values[0], Value::Timestamp(_)));

        let truncated = stamp_audit_columns(batch(), LoadStrategy::TruncateInsert, &snap).unwrap();
        assert_eq!(truncated.column_count(), 4);

        assert_eq!(stamp_audit_columns(batch(), LoadStrategy::Upsert, &snap).unwrap().column_count(), 2);
    }

    #[test]
    fn test_no_stamping_without_audit_columns() {
        let snap = snapshot(&[("id", "integer"), ("v", "text")]);
        assert_eq!(stamp_audit_columns(batch(), LoadStrategy::Insert, &snap).unwrap().column_count(), 2);
    }

    struct BrokenProgress {
        calls: usize,
    }

    #[async_trait]
    impl LoadProgress for BrokenProgress {
        async fn slice_done(&mut self, _rows_processed: u64, _rows_failed: u64) -> Result<()> {
            self.calls += 1;
            Err(EngineError::Batch("run store unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_slice_failure_survives_progress_failure() {
        let config = DestinationConfig {
            kind: DestinationKind::Postgresql,
            credential_id: 1,
            schema: "public".into(),
            table: "items".into(),
        };
        let connector = MemoryConnector::new();
        connector.insert_table(&config, MemoryTable::new(&[("id", "bigint"), ("v", "text")]));
        connector.fail_writes_after(&config, 0, "disk full");

        let mut dest = connector.connect(&config).await.unwrap();
        let snap = dest.describe().await.unwrap().unwrap();
        let mut progress = BrokenProgress { calls: 0 };
        let err = Loader::new(10, Arc::new(TypeRegistry::postgres()))
            .load(dest.as_mut(), batch(), &snap, LoadStrategy::Insert, &[], &mut progress)
            .await
            .unwrap_err();

        assert_eq!(progress.calls, 1);
        match err {
            EngineError::LoadFailed { table, slice, rows, message, .. } => {
                assert_eq!(table, "\"public\".\"items\"");
                assert_eq!(slice, 1);
                assert_eq!(rows, 1);
                assert!(message.contains("disk full"), "{}", message);
            },
            other => panic!("expected LoadFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_slice_count() {
        let types = Arc::new(TypeRegistry::postgres());
        let loader = Loader::new(2, types.clone());
        assert_eq!(loader.slice_count(3), 2);
        assert_eq!(loader.slice_count(0), 0);
        assert_eq!(Loader::new(10_000, types).slice_count(3), 1);
    }
}
