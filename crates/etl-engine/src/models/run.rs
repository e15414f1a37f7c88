//! Run records (maps to the job_runs table)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Lifecycle of one run. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for RunStatus {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(EngineError::CorruptRecord(format!("unknown run status '{}'", s))),
        }
    }
}

/// Stage a run was in when it stopped; used in the failure summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    /// Loading and checking the job definition
    Validate,
    Extract,
    Transform,
    Reconcile,
    Load,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Validate => "validate",
            RunStage::Extract => "extract",
            RunStage::Transform => "transform",
            RunStage::Reconcile => "reconcile",
            RunStage::Load => "load",
        }
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub job_id: i64,
    pub status: RunStatus,
    pub rows_total: i64,
    pub rows_processed: i64,
    pub rows_failed: i64,
    /// Mirrors `rows_failed` for consumers of the older schema
    pub error_count: i64,
    pub progress_percentage: i32,
    pub message: Option<String>,
    pub error_message: Option<String>,
    /// "manual", "schedule" or a user id
    pub triggered_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Fresh record as created by the trigger side before the engine runs
    pub fn pending(id: i64, job_id: i64) -> Self {
        Self {
            id,
            job_id,
            status: RunStatus::Pending,
            rows_total: 0,
            rows_processed: 0,
            rows_failed: 0,
            error_count: 0,
            progress_percentage: 0,
            message: None,
            error_message: None,
            triggered_by: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::try_from(status.as_str().to_string()).unwrap(), status);
        }
        assert!(matches!(
            RunStatus::try_from("retrying".to_string()),
            Err(EngineError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_pending_record() {
        let run = RunRecord::pending(4, 2);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.progress_percentage, 0);
        assert!(run.started_at.is_none());
    }
}
