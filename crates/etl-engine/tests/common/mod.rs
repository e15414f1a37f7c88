//! Shared helpers for the engine integration tests
//!
//! - [`MemoryHarness`]: engine wired to in-process stores, uploaded files in a
//!   temporary directory and the in-memory destination
//! - [`TestPostgres`]: PostgreSQL container with the job/run migrations applied
//!
//! Container tests require Docker and are `#[ignore]`d:
//!
//! ```bash
//! cargo test -p etl-engine --test postgres_tests -- --ignored --nocapture
//! ```

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tempfile::TempDir;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

use etl_engine::destination::{is_audit_column, MemoryConnector};
use etl_engine::models::{
    ColumnMapping, DestinationConfig, DestinationKind, JobDefinition, LoadStrategy, RunRecord,
    SourceConfig,
};
use etl_engine::schema::{DdlGenerator, TypeRegistry};
use etl_engine::source::{LocalFileStore, SheetsReader, SourceReader, StaticTokenAccess};
use etl_engine::store::MemoryRunStore;
use etl_engine::transform::TransformRegistry;
use etl_engine::Engine;

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,etl_engine=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Job fixtures
// ============================================================================

pub fn destination(table: &str) -> DestinationConfig {
    DestinationConfig {
        kind: DestinationKind::Postgresql,
        credential_id: 1,
        schema: "public".to_string(),
        table: table.to_string(),
    }
}

/// CSV-sourced job whose table DDL is generated from its mappings
pub fn csv_job(
    id: i64,
    file_id: &str,
    table: &str,
    strategy: LoadStrategy,
    mappings: Vec<ColumnMapping>,
) -> JobDefinition {
    let ddl = DdlGenerator::new(Arc::new(TypeRegistry::postgres()))
        .generate("public", table, &mappings)
        .unwrap();
    let upsert_keys = if strategy == LoadStrategy::Upsert {
        mappings
            .iter()
            .filter(|m| m.is_primary_key && !m.exclude)
            .map(|m| m.destination_column.clone())
            .collect()
    } else {
        Vec::new()
    };
    JobDefinition {
        id,
        name: format!("job {}", id),
        source: SourceConfig::Csv {
            file_id: file_id.to_string(),
        },
        destination: destination(table),
        load_strategy: strategy,
        upsert_keys,
        batch_size: 2,
        create_new_table: false,
        table_ddl: Some(ddl),
        column_mappings: mappings,
    }
}

/// Business (non-audit) column names of a table, in ordinal order
pub fn business_columns(connector: &MemoryConnector, config: &DestinationConfig) -> Vec<String> {
    connector
        .table(config)
        .expect("table exists")
        .column_names()
        .into_iter()
        .filter(|c| !is_audit_column(c))
        .map(str::to_string)
        .collect()
}

// ============================================================================
// In-process engine
// ============================================================================

pub struct MemoryHarness {
    uploads: TempDir,
    pub runs: MemoryRunStore,
    pub destinations: MemoryConnector,
    next_run: AtomicI64,
}

impl MemoryHarness {
    pub fn new() -> Self {
        Self {
            uploads: tempfile::tempdir().unwrap(),
            runs: MemoryRunStore::new(),
            destinations: MemoryConnector::new(),
            next_run: AtomicI64::new(1),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        self.uploads.path()
    }

    pub fn write_csv(&self, file_id: &str, contents: &str) {
        std::fs::write(self.uploads.path().join(format!("{}.csv", file_id)), contents).unwrap();
    }

    pub fn add_job(&self, job: JobDefinition) {
        self.runs.insert_job(job);
    }

    pub fn engine(&self) -> Engine {
        self.engine_with_sheets("http://127.0.0.1:9")
    }

    /// Engine whose spreadsheet reader talks to `sheets_url`
    pub fn engine_with_sheets(&self, sheets_url: &str) -> Engine {
        let sheets =
            SheetsReader::new(sheets_url, Arc::new(StaticTokenAccess("tok".to_string()))).unwrap();
        Engine::new(
            Arc::new(self.runs.clone()),
            SourceReader::new(Arc::new(LocalFileStore::new(self.uploads.path())), sheets),
            Arc::new(self.destinations.clone()),
            Arc::new(TransformRegistry::builtin()),
            Arc::new(TypeRegistry::postgres()),
        )
    }

    /// Create a pending run of `job_id`
    pub fn pending_run(&self, job_id: i64) -> i64 {
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst);
        self.runs.insert_run(RunRecord::pending(run_id, job_id));
        run_id
    }

    /// Execute a fresh run of `job_id`; returns the run id and the outcome.
    pub async fn run(&self, job_id: i64) -> (i64, etl_engine::Result<RunRecord>) {
        self.run_with(&self.engine(), job_id).await
    }

    pub async fn run_with(
        &self,
        engine: &Engine,
        job_id: i64,
    ) -> (i64, etl_engine::Result<RunRecord>) {
        let run_id = self.pending_run(job_id);
        let outcome = engine.execute_run(job_id, run_id).await;
        (run_id, outcome)
    }

    /// Persisted state of a run
    pub fn record(&self, run_id: i64) -> RunRecord {
        self.runs.run(run_id).expect("run exists")
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    /// Start a PostgreSQL container with the migrations applied
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}
