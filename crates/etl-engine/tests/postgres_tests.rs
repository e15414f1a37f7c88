//! Runs against a real PostgreSQL: job/run persistence, DDL, upserts and
//! statement splitting.
//!
//! Requires Docker:
//!
//! ```bash
//! cargo test -p etl-engine --test postgres_tests -- --ignored --nocapture
//! ```

mod common;

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serial_test::serial;
use sqlx::PgPool;

use common::{init_test_tracing, TestPostgres};
use etl_engine::batch::DataType;
use etl_engine::destination::PgConnector;
use etl_engine::models::{ColumnMapping, LoadStrategy, RunRecord, RunStatus};
use etl_engine::schema::{DdlGenerator, TypeRegistry};
use etl_engine::source::{LocalFileStore, SheetsReader, SourceReader};
use etl_engine::store::{CredentialStore, PgCredentialStore, PgRunStore, RunStore};
use etl_engine::transform::TransformRegistry;
use etl_engine::{Engine, EngineError};

fn engine(pool: &PgPool, uploads: &Path) -> Engine {
    let credentials = Arc::new(PgCredentialStore::new(pool.clone()));
    let sheets = SheetsReader::new("http://127.0.0.1:9", credentials.clone()).unwrap();
    Engine::new(
        Arc::new(PgRunStore::new(pool.clone())),
        SourceReader::new(Arc::new(LocalFileStore::new(uploads)), sheets),
        Arc::new(PgConnector::new(credentials)),
        Arc::new(TransformRegistry::builtin()),
        Arc::new(TypeRegistry::postgres()),
    )
}

/// The container database doubles as the destination warehouse.
async fn seed_credential(pg: &TestPostgres) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO credentials (name, kind, connection_string)
        VALUES ('warehouse', 'postgresql', $1)
        RETURNING id
        "#,
    )
    .bind(pg.connection_string())
    .fetch_one(pg.pool())
    .await
    .unwrap();
    id
}

struct JobSeed<'a> {
    file_id: &'a str,
    table: &'a str,
    strategy: LoadStrategy,
    upsert_keys: &'a [&'a str],
    batch_size: i32,
    mappings: Vec<ColumnMapping>,
}

async fn seed_job(pool: &PgPool, credential_id: i64, seed: JobSeed<'_>) -> i64 {
    let ddl = DdlGenerator::new(Arc::new(TypeRegistry::postgres()))
        .generate("public", seed.table, &seed.mappings)
        .unwrap();
    let (job_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO etl_jobs (name, source, destination, load_strategy, upsert_keys,
                              batch_size, table_ddl)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(format!("load {}", seed.table))
    .bind(serde_json::json!({ "kind": "csv", "file_id": seed.file_id }))
    .bind(serde_json::json!({
        "kind": "postgresql",
        "credential_id": credential_id,
        "schema": "public",
        "table": seed.table
    }))
    .bind(seed.strategy.as_str())
    .bind(seed.upsert_keys.iter().map(|k| k.to_string()).collect::<Vec<_>>())
    .bind(seed.batch_size)
    .bind(ddl)
    .fetch_one(pool)
    .await
    .unwrap();

    for m in &seed.mappings {
        sqlx::query(
            r#"
            INSERT INTO column_mappings (job_id, source_column, destination_column,
                                         destination_type, transformations, is_nullable,
                                         default_value, exclude, is_primary_key,
                                         calculated_expression, column_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job_id)
        .bind(&m.source_column)
        .bind(&m.destination_column)
        .bind(m.destination_type.as_str())
        .bind(&m.transformations)
        .bind(m.is_nullable)
        .bind(&m.default_value)
        .bind(m.exclude)
        .bind(m.is_primary_key)
        .bind(&m.calculated_expression)
        .bind(m.order)
        .execute(pool)
        .await
        .unwrap();
    }
    job_id
}

async fn seed_run(pool: &PgPool, job_id: i64) -> i64 {
    let (run_id,): (i64,) = sqlx::query_as(
        "INSERT INTO job_runs (job_id, triggered_by) VALUES ($1, 'test') RETURNING id",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
    .unwrap();
    run_id
}

async fn run(pg: &TestPostgres, uploads: &Path, job_id: i64) -> (i64, etl_engine::Result<RunRecord>) {
    let run_id = seed_run(pg.pool(), job_id).await;
    let outcome = engine(pg.pool(), uploads).execute_run(job_id, run_id).await;
    (run_id, outcome)
}

fn kv_mappings() -> Vec<ColumnMapping> {
    vec![
        ColumnMapping::new("id", "id", DataType::Integer).primary_key(),
        ColumnMapping::new("v", "v", DataType::Text).with_order(1),
    ]
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_run_store_reads_jobs_and_persists_runs() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let credential_id = seed_credential(&pg).await;
    let job_id = seed_job(
        pg.pool(),
        credential_id,
        JobSeed {
            file_id: "kv",
            table: "kv",
            strategy: LoadStrategy::Upsert,
            upsert_keys: &["id"],
            batch_size: 50,
            mappings: kv_mappings(),
        },
    )
    .await;
    let run_id = seed_run(pg.pool(), job_id).await;

    let store = PgRunStore::new(pg.pool().clone());
    let job = store.load_job_definition(job_id).await.unwrap();
    assert_eq!(job.load_strategy, LoadStrategy::Upsert);
    assert_eq!(job.upsert_keys, vec!["id"]);
    assert_eq!(job.batch_size, 50);
    assert_eq!(job.expected_columns(), vec!["id", "v"]);
    assert_eq!(job.destination.credential_id, credential_id);
    job.validate().unwrap();

    let mut record = store.load_run_record(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Pending);
    assert_eq!(record.triggered_by.as_deref(), Some("test"));
    record.status = RunStatus::Running;
    record.rows_total = 10;
    record.progress_percentage = 30;
    store.persist_run_record(&record).await.unwrap();
    let reread = store.load_run_record(run_id).await.unwrap();
    assert_eq!(reread.status, RunStatus::Running);
    assert_eq!(reread.progress_percentage, 30);

    assert!(matches!(
        store.load_job_definition(9999).await,
        Err(EngineError::NotFound(_))
    ));

    let credentials = PgCredentialStore::new(pg.pool().clone());
    let handle = credentials.resolve_connection(credential_id).await.unwrap();
    assert_eq!(handle.expose(), pg.connection_string());
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_insert_creates_table_and_completes_run() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let uploads = tempfile::tempdir().unwrap();
    std::fs::write(
        uploads.path().join("orders.csv"),
        "id,name,amt\n1,Ann,10.5\n2,Bob,3\n3,Cy,7\n",
    )
    .unwrap();
    let credential_id = seed_credential(&pg).await;
    let job_id = seed_job(
        pg.pool(),
        credential_id,
        JobSeed {
            file_id: "orders",
            table: "orders",
            strategy: LoadStrategy::Insert,
            upsert_keys: &[],
            batch_size: 2,
            mappings: vec![
                ColumnMapping::new("id", "id", DataType::Integer).primary_key(),
                ColumnMapping::new("name", "full_name", DataType::Text).with_order(1),
                ColumnMapping::new("amt", "amt", DataType::Numeric).excluded().with_order(2),
            ],
        },
    )
    .await;

    let (run_id, outcome) = run(&pg, uploads.path(), job_id).await;
    let record = outcome.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.rows_processed, 3);

    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, full_name FROM public.orders ORDER BY id")
            .fetch_all(pg.pool())
            .await
            .unwrap();
    assert_eq!(rows, vec![(1, "Ann".into()), (2, "Bob".into()), (3, "Cy".into())]);

    let columns: Vec<(String,)> = sqlx::query_as(
        "SELECT column_name::text FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = 'orders' ORDER BY ordinal_position",
    )
    .fetch_all(pg.pool())
    .await
    .unwrap();
    let columns: Vec<String> = columns.into_iter().map(|(c,)| c).collect();
    assert_eq!(columns, vec!["id", "full_name", "created_at", "updated_at"]);

    let (status, progress): (String, i32) =
        sqlx::query_as("SELECT status, progress_percentage FROM job_runs WHERE id = $1")
            .bind(run_id)
            .fetch_one(pg.pool())
            .await
            .unwrap();
    assert_eq!(status, "completed");
    assert_eq!(progress, 100);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_upsert_keeps_updated_at_for_unchanged_rows() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let uploads = tempfile::tempdir().unwrap();
    let csv = uploads.path().join("kv.csv");
    std::fs::write(&csv, "id,v,score\n1,a,1.10\n2,,\n").unwrap();
    let credential_id = seed_credential(&pg).await;
    let mut mappings = kv_mappings();
    mappings.push(ColumnMapping::new("score", "score", DataType::Numeric).with_order(2));
    let job_id = seed_job(
        pg.pool(),
        credential_id,
        JobSeed {
            file_id: "kv",
            table: "kv",
            strategy: LoadStrategy::Upsert,
            upsert_keys: &["id"],
            batch_size: 100,
            mappings,
        },
    )
    .await;

    let stamps = |pool: PgPool| async move {
        sqlx::query_as::<_, (i64, Option<String>, NaiveDateTime)>(
            "SELECT id, v, updated_at FROM public.kv ORDER BY id",
        )
        .fetch_all(&pool)
        .await
        .unwrap()
    };

    run(&pg, uploads.path(), job_id).await.1.unwrap();
    let first = stamps(pg.pool().clone()).await;
    assert_eq!(first.len(), 2);

    // same values, nulls included: nothing is distinct, nothing is touched
    let (_, again) = run(&pg, uploads.path(), job_id).await;
    assert_eq!(again.unwrap().rows_processed, 2);
    assert_eq!(stamps(pg.pool().clone()).await, first);

    std::fs::write(&csv, "id,v,score\n1,b,1.10\n2,,\n").unwrap();
    run(&pg, uploads.path(), job_id).await.1.unwrap();
    let third = stamps(pg.pool().clone()).await;
    assert_eq!(third[0].1.as_deref(), Some("b"));
    assert!(third[0].2 > first[0].2);
    assert_eq!(third[1], first[1]);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_auto_add_then_strict_upsert_mismatch() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let uploads = tempfile::tempdir().unwrap();
    std::fs::write(
        uploads.path().join("sales.csv"),
        "id,amount,region\n1,2.5,north\n2,3,south\n",
    )
    .unwrap();
    let credential_id = seed_credential(&pg).await;
    let mappings = vec![
        ColumnMapping::new("id", "id", DataType::Integer).primary_key(),
        ColumnMapping::new("amount", "amount", DataType::Numeric).with_order(1),
        ColumnMapping::new("region", "region", DataType::Text).with_order(2),
    ];
    let create = "CREATE TABLE public.sales (id BIGINT PRIMARY KEY, amount NUMERIC(10,2))";

    sqlx::raw_sql(create).execute(pg.pool()).await.unwrap();
    let insert_job = seed_job(
        pg.pool(),
        credential_id,
        JobSeed {
            file_id: "sales",
            table: "sales",
            strategy: LoadStrategy::Insert,
            upsert_keys: &[],
            batch_size: 10,
            mappings: mappings.clone(),
        },
    )
    .await;
    run(&pg, uploads.path(), insert_job).await.1.unwrap();
    let (region,): (String,) = sqlx::query_as("SELECT region FROM public.sales WHERE id = 1")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(region, "north");

    sqlx::raw_sql("DROP TABLE public.sales").execute(pg.pool()).await.unwrap();
    sqlx::raw_sql(create).execute(pg.pool()).await.unwrap();
    let upsert_job = seed_job(
        pg.pool(),
        credential_id,
        JobSeed {
            file_id: "sales",
            table: "sales",
            strategy: LoadStrategy::Upsert,
            upsert_keys: &["id"],
            batch_size: 10,
            mappings,
        },
    )
    .await;
    let (run_id, outcome) = run(&pg, uploads.path(), upsert_job).await;
    assert!(matches!(outcome, Err(EngineError::SchemaMismatchForUpsert { .. })));

    let (status, message): (String, Option<String>) =
        sqlx::query_as("SELECT status, error_message FROM job_runs WHERE id = $1")
            .bind(run_id)
            .fetch_one(pg.pool())
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert!(message.unwrap().contains("missing columns [region]"));
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_upsert_provisions_missing_primary_key() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let uploads = tempfile::tempdir().unwrap();
    std::fs::write(uploads.path().join("kv.csv"), "id,v\n1,a\n2,b\n").unwrap();
    sqlx::raw_sql("CREATE TABLE public.kv (id BIGINT NOT NULL, v TEXT)")
        .execute(pg.pool())
        .await
        .unwrap();
    let credential_id = seed_credential(&pg).await;
    let job_id = seed_job(
        pg.pool(),
        credential_id,
        JobSeed {
            file_id: "kv",
            table: "kv",
            strategy: LoadStrategy::Upsert,
            upsert_keys: &["id"],
            batch_size: 10,
            mappings: kv_mappings(),
        },
    )
    .await;

    let record = run(&pg, uploads.path(), job_id).await.1.unwrap();
    assert_eq!(record.rows_processed, 2);

    let (constraint,): (String,) = sqlx::query_as(
        "SELECT conname::text FROM pg_constraint WHERE conrelid = 'public.kv'::regclass \
         AND contype = 'p'",
    )
    .fetch_one(pg.pool())
    .await
    .unwrap();
    assert_eq!(constraint, "kv_pkey");
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_wide_slice_is_split_across_statements() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
    let uploads = tempfile::tempdir().unwrap();

    // 70 columns plus two audit columns, 1000 rows in one slice: 72000 binds
    let width = 70;
    let header: Vec<String> = (0..width).map(|c| format!("c{}", c)).collect();
    let mut csv = header.join(",");
    csv.push('\n');
    for row in 0..1000 {
        let cells: Vec<String> = (0..width).map(|c| (row * width + c).to_string()).collect();
        csv.push_str(&cells.join(","));
        csv.push('\n');
    }
    std::fs::write(uploads.path().join("wide.csv"), csv).unwrap();

    let credential_id = seed_credential(&pg).await;
    let mappings = header
        .iter()
        .enumerate()
        .map(|(i, name)| ColumnMapping::new(name, name, DataType::Integer).with_order(i as i32))
        .collect();
    let job_id = seed_job(
        pg.pool(),
        credential_id,
        JobSeed {
            file_id: "wide",
            table: "wide",
            strategy: LoadStrategy::Insert,
            upsert_keys: &[],
            batch_size: 1000,
            mappings,
        },
    )
    .await;

    let record = run(&pg, uploads.path(), job_id).await.1.unwrap();
    assert_eq!(record.rows_processed, 1000);

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM public.wide")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(count, 1000);
}
