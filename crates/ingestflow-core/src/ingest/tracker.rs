//! Run/audit tracker.
//!
//! Wraps `RunRepository` to drive a `DownloadRun` through
//! `Pending -> Running -> terminal`, record progress, and append audit log
//! entries. Log entries are built with [`AuditContext`] and flushed in
//! batches; the tracker never writes while a step transaction is open.

use chrono::Utc;
use ingestflow_types::run::{DownloadLog, DownloadRun, LogStatus, RunCounts, RunStatus};
use ingestflow_types::workflow::{ApiConfig, IngestTask};
use uuid::Uuid;

use crate::repository::run::RunRepository;

// ---------------------------------------------------------------------------
// Labels and truncation
// ---------------------------------------------------------------------------

/// `task[step]`, or `task[step][combo N]` for a loop combination.
pub fn step_label(task_name: &str, step_name: &str, combo_index: Option<usize>) -> String {
    match combo_index {
        Some(n) => format!("{task_name}[{step_name}][combo {n}]"),
        None => format!("{task_name}[{step_name}]"),
    }
}

pub fn loop_summary_label(task_name: &str, step_name: &str) -> String {
    format!("{task_name}[{step_name}][loop summary]")
}

/// Cut `text` to at most `max` characters, appending `marker` when cut.
pub fn truncate_chars(text: &str, max: usize, marker: &str) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}{marker}", &text[..byte_idx]),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// AuditContext
// ---------------------------------------------------------------------------

/// Fields shared by every log entry of one run.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub run_id: Uuid,
    pub task_id: i64,
    pub download_date: String,
    pub max_error_len: usize,
}

impl AuditContext {
    pub fn new(run_id: Uuid, task: &IngestTask, max_error_len: usize) -> Self {
        Self {
            run_id,
            task_id: task.task_id,
            download_date: task.download_date.clone(),
            max_error_len,
        }
    }

    fn entry(
        &self,
        label: String,
        api: Option<&ApiConfig>,
        record_count: i64,
        status: LogStatus,
        error_message: Option<String>,
        duration_seconds: f64,
    ) -> DownloadLog {
        DownloadLog {
            id: Uuid::now_v7(),
            run_id: self.run_id,
            task_id: self.task_id,
            label,
            config_id: api.map(|a| a.id),
            api_name: api.map(|a| a.api_name.clone()),
            download_date: Some(self.download_date.clone()),
            record_count,
            status,
            error_message,
            file_path: None,
            duration_seconds,
            created_at: Utc::now(),
        }
    }

    pub fn success(
        &self,
        label: String,
        api: Option<&ApiConfig>,
        record_count: i64,
        duration_seconds: f64,
    ) -> DownloadLog {
        self.entry(label, api, record_count, LogStatus::Success, None, duration_seconds)
    }

    /// A failure entry; the message is cut to the configured maximum.
    pub fn failure(
        &self,
        label: String,
        api: Option<&ApiConfig>,
        record_count: i64,
        message: &str,
        duration_seconds: f64,
    ) -> DownloadLog {
        let message = truncate_chars(message, self.max_error_len, "\n... (truncated)");
        self.entry(
            label,
            api,
            record_count,
            LogStatus::Fail,
            Some(message),
            duration_seconds,
        )
    }

    /// A loop summary entry. The summary JSON travels in `error_message`
    /// regardless of status.
    pub fn summary(
        &self,
        label: String,
        api: Option<&ApiConfig>,
        record_count: i64,
        failed: bool,
        summary_json: String,
        duration_seconds: f64,
    ) -> DownloadLog {
        let status = if failed { LogStatus::Fail } else { LogStatus::Success };
        self.entry(label, api, record_count, status, Some(summary_json), duration_seconds)
    }
}

// ---------------------------------------------------------------------------
// RunTracker
// ---------------------------------------------------------------------------

/// Errors that can occur while recording run state.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("run repository error: {0}")]
    Repository(String),

    #[error("illegal run transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
}

/// Owns the `DownloadRun` record of one orchestrator invocation.
pub struct RunTracker<'a, R: RunRepository> {
    repo: &'a R,
    run: DownloadRun,
}

impl<'a, R: RunRepository> RunTracker<'a, R> {
    /// Persist a new `Pending` run.
    pub async fn create(repo: &'a R, task_id: i64, workflow_id: i64) -> Result<Self, TrackerError> {
        let run = DownloadRun::pending(task_id, workflow_id);
        repo.create_run(&run)
            .await
            .map_err(|e| TrackerError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run.id, task_id, "created download run");
        Ok(Self { repo, run })
    }

    pub fn run(&self) -> &DownloadRun {
        &self.run
    }

    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), TrackerError> {
        if !self.run.status.can_transition_to(next) {
            return Err(TrackerError::InvalidTransition {
                from: self.run.status,
                to: next,
            });
        }
        self.run.status = next;
        Ok(())
    }

    async fn persist(&self) -> Result<(), TrackerError> {
        self.repo
            .update_run(&self.run)
            .await
            .map_err(|e| TrackerError::Repository(e.to_string()))
    }

    /// `Pending -> Running`, recording the start time.
    pub async fn start(&mut self) -> Result<(), TrackerError> {
        self.transition(RunStatus::Running)?;
        self.run.start_time = Some(Utc::now());
        self.persist().await?;
        tracing::info!(run_id = %self.run.id, task_id = self.run.task_id, "download run started");
        Ok(())
    }

    /// Record completed task steps as a percentage of all task steps.
    pub async fn set_progress(&mut self, completed: usize, total: usize) -> Result<(), TrackerError> {
        let pct = if total == 0 {
            100
        } else {
            ((completed.min(total) * 100) / total) as u8
        };
        if pct == self.run.progress {
            return Ok(());
        }
        self.run.progress = pct;
        self.persist().await
    }

    /// Append buffered log entries and clear the buffer.
    pub async fn flush_logs(&self, logs: &mut Vec<DownloadLog>) -> Result<(), TrackerError> {
        if logs.is_empty() {
            return Ok(());
        }
        self.repo
            .append_logs(logs)
            .await
            .map_err(|e| TrackerError::Repository(e.to_string()))?;
        logs.clear();
        Ok(())
    }

    /// Move the run to a terminal state with end time, counts and error.
    pub async fn finish(
        &mut self,
        status: RunStatus,
        counts: RunCounts,
        error_message: Option<String>,
    ) -> Result<(), TrackerError> {
        self.transition(status)?;
        let now = Utc::now();
        self.run.end_time = Some(match self.run.start_time {
            Some(start) if start > now => start,
            _ => now,
        });
        self.run.total_records = counts.total_records;
        self.run.success_records = counts.success_records;
        self.run.fail_records = counts.fail_records;
        self.run.error_message = error_message;
        if status == RunStatus::Success {
            self.run.progress = 100;
        }
        self.persist().await?;

        tracing::info!(
            run_id = %self.run.id,
            status = %status,
            total_records = counts.total_records,
            "download run finished"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::MemoryRuns;

    fn task() -> IngestTask {
        IngestTask {
            task_id: 5,
            task_name: "daily".to_string(),
            workflow_id: 1,
            default_table_name: None,
            task_params: Default::default(),
            download_date: "20240102".to_string(),
            config_id: None,
            output: Default::default(),
        }
    }

    #[test]
    fn labels() {
        assert_eq!(step_label("daily", "quotes", None), "daily[quotes]");
        assert_eq!(step_label("daily", "quotes", Some(3)), "daily[quotes][combo 3]");
        assert_eq!(loop_summary_label("daily", "quotes"), "daily[quotes][loop summary]");
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_chars("abc", 5, "..."), "abc");
        assert_eq!(truncate_chars("abcdef", 3, "..."), "abc...");
        assert_eq!(truncate_chars("日本語テキスト", 3, "~"), "日本語~");
    }

    #[test]
    fn failure_entries_are_truncated() {
        let audit = AuditContext::new(Uuid::nil(), &task(), 10);
        let log = audit.failure("daily[s]".to_string(), None, 0, &"x".repeat(50), 0.5);
        assert_eq!(log.status, LogStatus::Fail);
        let msg = log.error_message.unwrap();
        assert!(msg.starts_with(&"x".repeat(10)));
        assert!(msg.ends_with("(truncated)"));
        assert_eq!(log.download_date.as_deref(), Some("20240102"));
    }

    #[tokio::test]
    async fn successful_run_lifecycle() {
        let repo = MemoryRuns::default();
        let mut tracker = RunTracker::create(&repo, 5, 1).await.unwrap();
        assert_eq!(tracker.run().status, RunStatus::Pending);

        tracker.start().await.unwrap();
        tracker.set_progress(1, 2).await.unwrap();
        assert_eq!(tracker.run().progress, 50);

        let mut logs = vec![AuditContext::new(tracker.run_id(), &task(), 100).success(
            "daily[s]".to_string(),
            None,
            3,
            0.1,
        )];
        tracker.flush_logs(&mut logs).await.unwrap();
        assert!(logs.is_empty());

        let counts = RunCounts {
            total_records: 3,
            success_records: 3,
            fail_records: 0,
        };
        tracker.finish(RunStatus::Success, counts, None).await.unwrap();

        let stored = repo.get_run(&tracker.run_id()).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert!(stored.end_time.unwrap() >= stored.start_time.unwrap());
        assert!(stored.error_message.is_none());
        assert_eq!(stored.progress, 100);
        assert_eq!(repo.list_logs(&tracker.run_id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_runs_cannot_transition_again() {
        let repo = MemoryRuns::default();
        let mut tracker = RunTracker::create(&repo, 5, 1).await.unwrap();
        tracker.start().await.unwrap();
        tracker
            .finish(RunStatus::Failed, RunCounts::default(), Some("boom".to_string()))
            .await
            .unwrap();
        let err = tracker
            .finish(RunStatus::Success, RunCounts::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn pending_run_can_fail_directly() {
        let repo = MemoryRuns::default();
        let mut tracker = RunTracker::create(&repo, 5, 1).await.unwrap();
        tracker
            .finish(RunStatus::Failed, RunCounts::default(), Some("disabled".to_string()))
            .await
            .unwrap();
        let stored = repo.get_run(&tracker.run_id()).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("disabled"));
    }
}
