//! PostgreSQL-backed stores (`etl_jobs`, `column_mappings`, `job_runs`,
//! `credentials`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;

use super::{ConnectionHandle, CredentialStore, RunStore};
use crate::batch::DataType;
use crate::error::{EngineError, Result};
use crate::models::{
    ColumnMapping, DestinationConfig, JobDefinition, LoadStrategy, RunRecord, RunStatus,
    SourceConfig,
};
use crate::source::SheetsAccess;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    name: String,
    source: Json<SourceConfig>,
    destination: Json<DestinationConfig>,
    load_strategy: String,
    upsert_keys: Vec<String>,
    batch_size: i32,
    create_new_table: bool,
    table_ddl: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct MappingRow {
    source_column: Option<String>,
    destination_column: String,
    source_type: Option<String>,
    destination_type: String,
    transformations: Vec<String>,
    is_nullable: bool,
    default_value: Option<String>,
    exclude: bool,
    is_primary_key: bool,
    calculated_expression: Option<String>,
    column_order: i32,
}

impl MappingRow {
    fn into_mapping(self) -> Result<ColumnMapping> {
        let destination_type = DataType::from_tag(&self.destination_type).ok_or_else(|| {
            EngineError::InvalidJob(format!(
                "column '{}' has unknown type '{}'",
                self.destination_column, self.destination_type
            ))
        })?;
        Ok(ColumnMapping {
            source_column: self.source_column.filter(|s| !s.is_empty()),
            destination_column: self.destination_column,
            source_type: self.source_type.as_deref().and_then(DataType::from_tag),
            destination_type,
            transformations: self.transformations,
            is_nullable: self.is_nullable,
            default_value: self.default_value,
            exclude: self.exclude,
            is_primary_key: self.is_primary_key,
            calculated_expression: self.calculated_expression.filter(|e| !e.trim().is_empty()),
            order: self.column_order,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: i64,
    job_id: i64,
    status: String,
    rows_total: i64,
    rows_processed: i64,
    rows_failed: i64,
    error_count: i64,
    progress_percentage: i32,
    message: Option<String>,
    error_message: Option<String>,
    triggered_by: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = EngineError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            status: RunStatus::try_from(row.status).map_err(|e| match e {
                EngineError::CorruptRecord(m) => {
                    EngineError::CorruptRecord(format!("run {}: {}", row.id, m))
                },
                other => other,
            })?,
            rows_total: row.rows_total,
            rows_processed: row.rows_processed,
            rows_failed: row.rows_failed,
            error_count: row.error_count,
            progress_percentage: row.progress_percentage,
            message: row.message,
            error_message: row.error_message,
            triggered_by: row.triggered_by,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn load_job_definition(&self, job_id: i64) -> Result<JobDefinition> {
        let job = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, name, source, destination, load_strategy, upsert_keys,
                   batch_size, create_new_table, table_ddl
            FROM etl_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;

        let mappings = sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT source_column, destination_column, source_type, destination_type,
                   transformations, is_nullable, default_value, exclude, is_primary_key,
                   calculated_expression, column_order
            FROM column_mappings
            WHERE job_id = $1
            ORDER BY column_order, id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(MappingRow::into_mapping)
        .collect::<Result<Vec<_>>>()?;

        debug!(job_id = job_id, mappings = mappings.len(), "Loaded job definition");

        Ok(JobDefinition {
            id: job.id,
            name: job.name,
            source: job.source.0,
            destination: job.destination.0,
            load_strategy: job.load_strategy.parse::<LoadStrategy>()?,
            upsert_keys: job.upsert_keys,
            batch_size: usize::try_from(job.batch_size).map_err(|_| {
                EngineError::InvalidJob(format!("batch size {} is negative", job.batch_size))
            })?,
            create_new_table: job.create_new_table,
            table_ddl: job.table_ddl,
            column_mappings: mappings,
        })
    }

    async fn load_run_record(&self, run_id: i64) -> Result<RunRecord> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, job_id, status, rows_total, rows_processed, rows_failed, error_count,
                   progress_percentage, message, error_message, triggered_by,
                   started_at, completed_at, created_at
            FROM job_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
        RunRecord::try_from(row)
    }

    async fn persist_run_record(&self, run: &RunRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2,
                rows_total = $3,
                rows_processed = $4,
                rows_failed = $5,
                error_count = $6,
                progress_percentage = $7,
                message = $8,
                error_message = $9,
                started_at = $10,
                completed_at = $11
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.rows_total)
        .bind(run.rows_processed)
        .bind(run.rows_failed)
        .bind(run.error_count)
        .bind(run.progress_percentage)
        .bind(&run.message)
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }
}

/// Reads connection strings and sheet access tokens from `credentials`.
/// Values are stored as the engine needs them; encryption at rest is handled
/// outside this repository.
#[derive(Debug, Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn field(&self, credential_id: i64, column: &'static str) -> Result<Option<String>> {
        let sql = format!("SELECT {} FROM credentials WHERE id = $1", column);
        let row: Option<(Option<String>,)> = sqlx::query_as(&sql)
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((value,)) => Ok(value),
            None => Err(EngineError::NotFound(format!("credential {}", credential_id))),
        }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn resolve_connection(&self, credential_id: i64) -> Result<ConnectionHandle> {
        self.field(credential_id, "connection_string")
            .await?
            .map(ConnectionHandle::new)
            .ok_or_else(|| {
                EngineError::InvalidJob(format!(
                    "credential {} has no connection string",
                    credential_id
                ))
            })
    }
}

#[async_trait]
impl SheetsAccess for PgCredentialStore {
    async fn access_token(&self, credential_id: i64) -> Result<String> {
        self.field(credential_id, "access_token")
            .await?
            .ok_or_else(|| {
                EngineError::SourcePermissionDenied(format!(
                    "credential {} has no access token",
                    credential_id
                ))
            })
    }
}
