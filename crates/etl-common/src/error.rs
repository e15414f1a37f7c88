//! Error types shared across the ETL workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid {kind} name '{name}': {reason}")]
    InvalidIdentifier {
        kind: String,
        name: String,
        reason: String,
    },
}

impl CommonError {
    pub fn invalid_identifier(kind: &str, name: &str, reason: impl Into<String>) -> Self {
        CommonError::InvalidIdentifier {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
