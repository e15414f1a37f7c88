//! ETL Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and SQL identifier utilities for the ETL
//! engine workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Identifiers**: validation and quoting of schema/table/column names
//!
//! # Example
//!
//! ```no_run
//! use etl_common::identifier::{quote_ident, validate_identifier};
//!
//! fn column_sql(name: &str) -> etl_common::Result<String> {
//!     validate_identifier(name, "column")?;
//!     Ok(quote_ident(name))
//! }
//! ```

pub mod error;
pub mod identifier;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
