//! Run and audit records.
//!
//! A `DownloadRun` is created for every orchestrator invocation and walks the
//! `Pending -> Running -> terminal` state machine. `DownloadLog` entries are
//! append-only: one per step execution attempt, or one aggregated loop
//! summary per loop-mode step.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Status of a download run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }

    /// Legal transitions of the run state machine.
    ///
    /// `Pending` may fail directly when the run cannot even start.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => matches!(next, RunStatus::Running | RunStatus::Failed),
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Download run
// ---------------------------------------------------------------------------

/// One orchestrator invocation for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRun {
    pub id: Uuid,
    pub task_id: i64,
    pub workflow_id: i64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Completed task steps as a percentage of all task steps.
    pub progress: u8,
    pub total_records: i64,
    pub success_records: i64,
    pub fail_records: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DownloadRun {
    /// A fresh run record in `Pending`.
    pub fn pending(task_id: i64, workflow_id: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            workflow_id,
            status: RunStatus::Pending,
            start_time: None,
            end_time: None,
            progress: 0,
            total_records: 0,
            success_records: 0,
            fail_records: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// Aggregate record counts written when a run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total_records: i64,
    pub success_records: i64,
    pub fail_records: i64,
}

// ---------------------------------------------------------------------------
// Download log
// ---------------------------------------------------------------------------

/// Outcome recorded on a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Fail,
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStatus::Success => write!(f, "success"),
            LogStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Append-only audit entry for one step execution or loop summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub task_id: i64,
    /// `task[step]`, `task[step][combo N]` or `task[step][loop summary]`.
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_date: Option<String>,
    pub record_count: i64,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// File the batch was exported to, when the task saves to disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_run_defaults() {
        let run = DownloadRun::pending(42, 7);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.task_id, 42);
        assert_eq!(run.progress, 0);
        assert!(run.start_time.is_none());
        assert!(run.error_message.is_none());
    }

    #[test]
    fn run_state_machine_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn run_status_serde_matches_display() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::TimedOut,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json.as_str().unwrap(), status.to_string());
        }
    }
}
