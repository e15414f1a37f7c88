//! Job, run and credential persistence
//!
//! The engine only reads job definitions and credentials, and only writes run
//! records. Creating and deleting any of them belongs to the services around
//! the engine.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{JobDefinition, RunRecord};

pub use memory::{MemoryCredentialStore, MemoryRunStore};
pub use postgres::{PgCredentialStore, PgRunStore};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn load_job_definition(&self, job_id: i64) -> Result<JobDefinition>;

    async fn load_run_record(&self, run_id: i64) -> Result<RunRecord>;

    /// Overwrite the stored record; returns once the write is durable.
    async fn persist_run_record(&self, run: &RunRecord) -> Result<()>;
}

/// Connection string for a destination. Not printed by `Debug`.
#[derive(Clone)]
pub struct ConnectionHandle(String);

impl ConnectionHandle {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionHandle(***)")
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve_connection(&self, credential_id: i64) -> Result<ConnectionHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_handle_hides_url() {
        let handle = ConnectionHandle::new("postgresql://user:secret@db/etl");
        assert_eq!(format!("{:?}", handle), "ConnectionHandle(***)");
        assert!(handle.expose().contains("secret"));
    }
}
