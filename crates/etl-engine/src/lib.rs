//! ETL Execution Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Executes one run of an ETL job: reads a CSV file or spreadsheet range,
//! reshapes it through the job's column mappings, reconciles the destination
//! table's schema and writes the rows in slices, keeping a persisted run
//! record up to date for pollers.
//!
//! # Overview
//!
//! - **Sources**: [`source::SourceReader`] materializes a [`batch::TabularBatch`]
//!   with inferred column types
//! - **Transforms**: [`transform::TransformEngine`] applies renames, named
//!   transformations and sandboxed calculated expressions
//! - **Schema**: [`schema::SchemaReconciler`] creates, extends, checks or
//!   recreates the destination table depending on the load strategy
//! - **Load**: [`loader::Loader`] writes slices with insert, upsert or
//!   truncate-insert semantics
//! - **Tracking**: [`tracker::RunTracker`] owns the run state machine
//!
//! External collaborators (job/run persistence, credentials, uploaded files,
//! spreadsheet tokens, destination databases) sit behind traits so tests can
//! run every stage in process.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use etl_engine::destination::PgConnector;
//! use etl_engine::schema::TypeRegistry;
//! use etl_engine::source::{LocalFileStore, SheetsReader, SourceReader};
//! use etl_engine::store::{PgCredentialStore, PgRunStore};
//! use etl_engine::transform::TransformRegistry;
//! use etl_engine::Engine;
//!
//! async fn run(pool: sqlx::PgPool) -> etl_engine::Result<()> {
//!     let credentials = Arc::new(PgCredentialStore::new(pool.clone()));
//!     let sheets = SheetsReader::new("https://sheets.googleapis.com", credentials.clone())?;
//!     let engine = Engine::new(
//!         Arc::new(PgRunStore::new(pool)),
//!         SourceReader::new(Arc::new(LocalFileStore::new("./uploads")), sheets),
//!         Arc::new(PgConnector::new(credentials)),
//!         Arc::new(TransformRegistry::builtin()),
//!         Arc::new(TypeRegistry::postgres()),
//!     );
//!     engine.execute_run(1, 42).await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod destination;
pub mod error;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod schema;
pub mod source;
pub mod store;
pub mod tracker;
pub mod transform;

// Re-export commonly used types
pub use batch::{Column, DataType, TabularBatch, Value};
pub use error::{EngineError, ErrorKind, Result};
pub use models::{JobDefinition, LoadStrategy, RunRecord, RunStatus};
pub use orchestrator::Engine;
