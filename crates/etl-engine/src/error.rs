//! Engine error types
//!
//! Every stage either returns a complete result or one of these errors. The
//! orchestrator records `to_string()` of the error in the run record, so the
//! messages name the table, columns and remediation rather than just saying
//! that something failed.

use thiserror::Error;

use crate::models::LoadStrategy;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure classes of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Detected before any destination mutation (bad job definition, missing DDL)
    Configuration,
    Source,
    Transformation,
    Reconciliation,
    Load,
    /// Persistence, connectivity and invariant violations inside the engine
    Internal,
}

#[derive(Error, Debug)]
pub enum EngineError {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    #[error(
        "No DDL available to create table {table}: the table does not exist (or must be \
         recreated) and the job has no table DDL configured"
    )]
    NoDDLAvailable { table: String },

    // ------------------------------------------------------------------
    // Source
    // ------------------------------------------------------------------
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Source is empty: {0}")]
    SourceEmpty(String),

    #[error("Source is malformed: {0}")]
    SourceMalformed(String),

    #[error("Permission denied reading source: {0}")]
    SourcePermissionDenied(String),

    #[error("Invalid source range: {0}")]
    SourceRangeInvalid(String),

    // ------------------------------------------------------------------
    // Transformation
    // ------------------------------------------------------------------
    #[error("Source column '{column}' not found in data (available: {available})")]
    SourceColumnMissing { column: String, available: String },

    #[error("Unknown transformation '{name}'. Available transformations: {available}")]
    UnknownTransformation { name: String, available: String },

    #[error("Expression error in column '{column}': {message}")]
    ExpressionError { column: String, message: String },

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------
    #[error("Failed to alter table {table}: {message}")]
    SchemaAlterFailed { table: String, message: String },

    #[error(
        "Schema mismatch for upsert on {table}: missing columns [{}], unexpected columns [{}]. \
         Upsert requires the table columns to match the job's columns exactly; align the \
         table (ALTER TABLE) or the column mappings before re-running",
        missing.join(", "),
        extra.join(", ")
    )]
    SchemaMismatchForUpsert {
        table: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error(
        "Missing upsert constraint on {table}: no PRIMARY KEY or UNIQUE constraint covers \
         exactly ({}). {reason}. Run manually: {remediation}",
        columns.join(", ")
    )]
    MissingUpsertConstraint {
        table: String,
        columns: Vec<String>,
        reason: String,
        remediation: String,
    },

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------
    #[error(
        "Cannot convert column '{column}' to the destination type {native_type} of {table}: {message}"
    )]
    ColumnTypeConversionFailed {
        table: String,
        column: String,
        native_type: String,
        message: String,
    },

    #[error("Failed to write batch {slice} ({rows} rows) to {table} using {strategy}: {message}")]
    LoadFailed {
        table: String,
        slice: usize,
        rows: usize,
        strategy: LoadStrategy,
        message: String,
    },

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------
    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// A persisted row that does not decode into its model
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Tabular batch error: {0}")]
    Batch(String),

    /// Rejection reported by a destination that is not a database driver error
    #[error("Destination error: {0}")]
    Destination(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Common(#[from] etl_common::CommonError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidJob(_) | EngineError::NoDDLAvailable { .. } => {
                ErrorKind::Configuration
            },
            EngineError::Common(etl_common::CommonError::InvalidIdentifier { .. }) => {
                ErrorKind::Configuration
            },
            EngineError::SourceNotFound(_)
            | EngineError::SourceEmpty(_)
            | EngineError::SourceMalformed(_)
            | EngineError::SourcePermissionDenied(_)
            | EngineError::SourceRangeInvalid(_)
            | EngineError::Csv(_) => ErrorKind::Source,
            EngineError::SourceColumnMissing { .. }
            | EngineError::UnknownTransformation { .. }
            | EngineError::ExpressionError { .. } => ErrorKind::Transformation,
            EngineError::SchemaAlterFailed { .. }
            | EngineError::SchemaMismatchForUpsert { .. }
            | EngineError::MissingUpsertConstraint { .. } => ErrorKind::Reconciliation,
            EngineError::ColumnTypeConversionFailed { .. } | EngineError::LoadFailed { .. } => {
                ErrorKind::Load
            },
            _ => ErrorKind::Internal,
        }
    }

    pub(crate) fn expression(column: &str, message: impl Into<String>) -> Self {
        EngineError::ExpressionError {
            column: column.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            EngineError::NoDDLAvailable { table: "t".into() }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(EngineError::SourceEmpty("f".into()).kind(), ErrorKind::Source);
        assert_eq!(
            EngineError::expression("total", "unknown identifier 'x'").kind(),
            ErrorKind::Transformation
        );
        assert_eq!(
            EngineError::SchemaMismatchForUpsert {
                table: "t".into(),
                missing: vec![],
                extra: vec![]
            }
            .kind(),
            ErrorKind::Reconciliation
        );
        assert_eq!(EngineError::NotFound("run 1".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_mismatch_message_names_columns() {
        let err = EngineError::SchemaMismatchForUpsert {
            table: "\"public\".\"orders\"".into(),
            missing: vec!["region".into()],
            extra: vec!["legacy_flag".into(), "notes".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("missing columns [region]"));
        assert!(msg.contains("unexpected columns [legacy_flag, notes]"));
    }

    #[test]
    fn test_missing_constraint_message_has_remediation() {
        let err = EngineError::MissingUpsertConstraint {
            table: "\"public\".\"orders\"".into(),
            columns: vec!["id".into()],
            reason: "Adding the primary key failed: duplicate key".into(),
            remediation: "ALTER TABLE \"public\".\"orders\" ADD PRIMARY KEY (\"id\");".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exactly (id)"));
        assert!(msg.contains("ADD PRIMARY KEY (\"id\")"));
    }
}
