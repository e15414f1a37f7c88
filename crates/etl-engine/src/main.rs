//! ETL Engine - command-line entry point
//!
//! The scheduler invokes `etl-engine run --job-id N --run-id N` for every
//! triggered run; a non-zero exit status tells it the run failed.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use etl_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use etl_engine::config::EngineConfig;
use etl_engine::destination::PgConnector;
use etl_engine::schema::{DdlGenerator, TypeRegistry};
use etl_engine::source::{LocalFileStore, SheetsReader, SourceReader};
use etl_engine::store::{PgCredentialStore, PgRunStore};
use etl_engine::transform::{TransformEngine, TransformRegistry};
use etl_engine::{Engine, JobDefinition};

/// ETL execution engine
#[derive(Parser, Debug)]
#[command(name = "etl-engine")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a pending run of a job
    Run {
        #[arg(long)]
        job_id: i64,

        #[arg(long)]
        run_id: i64,
    },

    /// Check a job definition file without touching any source or destination
    Validate {
        /// Job definition as JSON
        #[arg(long)]
        job: PathBuf,
    },

    /// Print the CREATE TABLE statement for a job definition file
    Ddl {
        #[arg(long)]
        job: PathBuf,
    },

    /// List the available column transformations
    Transforms {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("etl-engine".to_string())
        .filter_directives("etl_engine=debug,sqlx=warn".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    if let Err(e) = execute_command(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run { job_id, run_id } => run(job_id, run_id).await,
        Commands::Validate { job } => validate(&job),
        Commands::Ddl { job } => ddl(&job),
        Commands::Transforms { json } => transforms(json),
    }
}

async fn run(job_id: i64, run_id: i64) -> Result<()> {
    let config = EngineConfig::load()?;
    info!(job_id = job_id, run_id = run_id, "Starting ETL run");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to the job database")?;

    let credentials = Arc::new(PgCredentialStore::new(pool.clone()));
    let sheets = SheetsReader::new(&config.sources.sheets_api_base_url, credentials.clone())?;
    let sources = SourceReader::new(Arc::new(LocalFileStore::new(&config.sources.upload_dir)), sheets);

    let engine = Engine::new(
        Arc::new(PgRunStore::new(pool.clone())),
        sources,
        Arc::new(PgConnector::new(credentials)),
        Arc::new(TransformRegistry::builtin()),
        Arc::new(TypeRegistry::postgres()),
    )
    .with_destination_lock(config.load.lock_destination);

    let outcome = engine.execute_run(job_id, run_id).await;
    pool.close().await;

    let record = outcome?;
    info!(
        job_id = job_id,
        run_id = run_id,
        rows_processed = record.rows_processed,
        "Run completed"
    );
    Ok(())
}

/// Read a job definition file, filling in the configured batch size when the
/// file has none.
fn read_job(path: &Path) -> Result<JobDefinition> {
    let config = EngineConfig::load()?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let mut value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Job file {} is not valid JSON", path.display()))?;
    if let Some(object) = value.as_object_mut() {
        object
            .entry("batch_size")
            .or_insert_with(|| serde_json::Value::from(config.load.default_batch_size));
    }
    let job: JobDefinition = serde_json::from_value(value)
        .with_context(|| format!("Job file {} is not a job definition", path.display()))?;
    Ok(job)
}

fn validate(path: &Path) -> Result<()> {
    let job = read_job(path)?;
    job.validate()?;
    TransformEngine::new(Arc::new(TransformRegistry::builtin()))
        .validate_mappings(&job.column_mappings)?;

    println!(
        "Job {} ({}) is valid: {} -> {} using {}, {} active columns, batch size {}",
        job.id,
        job.name,
        job.source.describe(),
        job.destination.qualified_table(),
        job.load_strategy,
        job.active_mappings().len(),
        job.batch_size
    );
    Ok(())
}

fn ddl(path: &Path) -> Result<()> {
    let job = read_job(path)?;
    let generator = DdlGenerator::new(Arc::new(TypeRegistry::postgres()));
    let sql = generator.generate(
        &job.destination.schema,
        &job.destination.table,
        &job.column_mappings,
    )?;
    println!("{}", sql);
    Ok(())
}

fn transforms(json: bool) -> Result<()> {
    let registry = TransformRegistry::builtin();
    if json {
        println!("{}", serde_json::to_string_pretty(registry.list())?);
        return Ok(());
    }
    for spec in registry.list() {
        println!("{:<16} {:<10} {}", spec.name, spec.category.as_str(), spec.description);
    }
    Ok(())
}
