//! Run tracker
//!
//! Owns the run record for the duration of a run and persists it after every
//! change, so pollers always see the state of the last finished step.
//!
//! ```text
//! pending ──start──▶ running ──complete──▶ completed
//!                       │
//!                       └────fail────────▶ failed
//! ```
//!
//! Terminal states are absorbing and `running` cannot be skipped; anything
//! else is an [`EngineError::InvalidTransition`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::loader::LoadProgress;
use crate::models::{RunRecord, RunStage, RunStatus};
use crate::store::RunStore;

pub struct RunTracker {
    store: Arc<dyn RunStore>,
    record: RunRecord,
}

impl RunTracker {
    pub fn new(store: Arc<dyn RunStore>, record: RunRecord) -> Self {
        Self { store, record }
    }

    pub async fn load(store: Arc<dyn RunStore>, run_id: i64) -> Result<Self> {
        let record = store.load_run_record(run_id).await?;
        Ok(Self::new(store, record))
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn status(&self) -> RunStatus {
        self.record.status
    }

    fn require(&self, from: RunStatus, to: RunStatus) -> Result<()> {
        if self.record.status != from {
            return Err(EngineError::InvalidTransition {
                from: self.record.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        self.store.persist_run_record(&self.record).await
    }

    /// pending → running
    pub async fn start(&mut self) -> Result<()> {
        self.require(RunStatus::Pending, RunStatus::Running)?;
        self.record.status = RunStatus::Running;
        self.record.started_at = Some(Utc::now());
        self.record.message = Some("Run started".to_string());
        self.persist().await?;
        info!(run_id = self.record.id, job_id = self.record.job_id, "Run started");
        Ok(())
    }

    /// Note the stage being entered; progress counters are untouched.
    pub async fn enter_stage(&mut self, stage: RunStage) -> Result<()> {
        self.require(RunStatus::Running, RunStatus::Running)?;
        self.record.message = Some(match stage {
            RunStage::Validate => "Validating job definition".to_string(),
            RunStage::Extract => "Extracting source data".to_string(),
            RunStage::Transform => "Transforming data".to_string(),
            RunStage::Reconcile => "Reconciling destination schema".to_string(),
            RunStage::Load => format!("Loading {} rows", self.record.rows_total),
        });
        self.persist().await?;
        debug!(run_id = self.record.id, stage = %stage, "Entered stage");
        Ok(())
    }

    pub async fn set_total(&mut self, rows_total: u64) -> Result<()> {
        self.require(RunStatus::Running, RunStatus::Running)?;
        self.record.rows_total = to_i64(rows_total);
        self.persist().await
    }

    /// Cumulative counts after a slice. The percentage never decreases.
    pub async fn record_progress(&mut self, rows_processed: u64, rows_failed: u64) -> Result<()> {
        self.require(RunStatus::Running, RunStatus::Running)?;
        self.record.rows_processed = to_i64(rows_processed);
        self.record.rows_failed = to_i64(rows_failed);
        self.record.error_count = self.record.rows_failed;

        let percentage = progress_percentage(rows_processed, self.record.rows_total);
        self.record.progress_percentage = self.record.progress_percentage.max(percentage);
        self.persist().await?;

        debug!(
            run_id = self.record.id,
            rows_processed = rows_processed,
            rows_failed = rows_failed,
            progress = self.record.progress_percentage,
            "Progress updated"
        );
        Ok(())
    }

    /// running → completed, at 100%
    pub async fn complete(&mut self, summary: &str) -> Result<()> {
        self.require(RunStatus::Running, RunStatus::Completed)?;
        self.record.status = RunStatus::Completed;
        self.record.progress_percentage = 100;
        self.record.completed_at = Some(Utc::now());
        self.record.message = Some(summary.to_string());
        self.persist().await?;
        info!(
            run_id = self.record.id,
            rows_processed = self.record.rows_processed,
            "Run completed"
        );
        Ok(())
    }

    /// running → failed. Counts recorded so far are kept.
    pub async fn fail(&mut self, stage: RunStage, error: &EngineError) -> Result<()> {
        self.require(RunStatus::Running, RunStatus::Failed)?;
        self.record.status = RunStatus::Failed;
        self.record.completed_at = Some(Utc::now());
        self.record.message = Some(format!("Run failed during {}", stage));
        self.record.error_message = Some(error.to_string());
        self.persist().await?;
        warn!(
            run_id = self.record.id,
            stage = %stage,
            error = %error,
            "Run failed"
        );
        Ok(())
    }
}

#[async_trait]
impl LoadProgress for RunTracker {
    async fn slice_done(&mut self, rows_processed: u64, rows_failed: u64) -> Result<()> {
        self.record_progress(rows_processed, rows_failed).await
    }
}

/// `floor(processed / total * 100)`, capped at 100; zero while the total is
/// unknown
pub fn progress_percentage(rows_processed: u64, rows_total: i64) -> i32 {
    if rows_total <= 0 {
        return 0;
    }
    let pct = (u128::from(rows_processed) * 100) / rows_total as u128;
    pct.min(100) as i32
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
