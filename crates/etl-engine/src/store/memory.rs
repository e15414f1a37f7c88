//! In-process stores, used by tests and the `validate` command

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ConnectionHandle, CredentialStore, RunStore};
use crate::error::{EngineError, Result};
use crate::models::{JobDefinition, RunRecord};
use crate::source::SheetsAccess;

#[derive(Debug, Default)]
struct Records {
    jobs: HashMap<i64, JobDefinition>,
    runs: HashMap<i64, RunRecord>,
    /// Every persisted version of every run, oldest first
    history: Vec<RunRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    inner: Arc<Mutex<Records>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_job(&self, job: JobDefinition) {
        self.records().jobs.insert(job.id, job);
    }

    pub fn insert_run(&self, run: RunRecord) {
        self.records().runs.insert(run.id, run);
    }

    pub fn run(&self, run_id: i64) -> Option<RunRecord> {
        self.records().runs.get(&run_id).cloned()
    }

    /// Persisted versions of one run, in write order
    pub fn history(&self, run_id: i64) -> Vec<RunRecord> {
        self.records()
            .history
            .iter()
            .filter(|r| r.id == run_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn load_job_definition(&self, job_id: i64) -> Result<JobDefinition> {
        self.records()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))
    }

    async fn load_run_record(&self, run_id: i64) -> Result<RunRecord> {
        self.records()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))
    }

    async fn persist_run_record(&self, run: &RunRecord) -> Result<()> {
        let mut records = self.records();
        records.runs.insert(run.id, run.clone());
        records.history.push(run.clone());
        Ok(())
    }
}

/// Fixed credentials keyed by id
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    connections: HashMap<i64, String>,
    tokens: HashMap<i64, String>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(mut self, credential_id: i64, url: &str) -> Self {
        self.connections.insert(credential_id, url.to_string());
        self
    }

    pub fn with_token(mut self, credential_id: i64, token: &str) -> Self {
        self.tokens.insert(credential_id, token.to_string());
        self
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn resolve_connection(&self, credential_id: i64) -> Result<ConnectionHandle> {
        self.connections
            .get(&credential_id)
            .map(ConnectionHandle::new)
            .ok_or_else(|| EngineError::NotFound(format!("credential {}", credential_id)))
    }
}

#[async_trait]
impl SheetsAccess for MemoryCredentialStore {
    async fn access_token(&self, credential_id: i64) -> Result<String> {
        self.tokens.get(&credential_id).cloned().ok_or_else(|| {
            EngineError::SourcePermissionDenied(format!(
                "no access token for credential {}",
                credential_id
            ))
        })
    }
}
