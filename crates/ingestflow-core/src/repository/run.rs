//! Run/audit repository trait definition.
//!
//! Storage interface for download runs and their append-only log entries.
//! The infrastructure layer (ingestflow-infra) implements this trait with
//! SQLite persistence.

use ingestflow_types::error::RepositoryError;
use ingestflow_types::run::{DownloadLog, DownloadRun};
use uuid::Uuid;

/// Repository trait for run and audit log persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run record.
    fn create_run(
        &self,
        run: &DownloadRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite the mutable fields of an existing run (status, times,
    /// progress, counts, error). Returns `NotFound` if the run is unknown.
    fn update_run(
        &self,
        run: &DownloadRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by ID.
    fn get_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<DownloadRun>, RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by task.
    fn list_runs(
        &self,
        task_id: Option<i64>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<DownloadRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Logs
    // -----------------------------------------------------------------------

    /// Append log entries in order.
    fn append_logs(
        &self,
        logs: &[DownloadLog],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List the logs of a run in creation order.
    fn list_logs(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<DownloadLog>, RepositoryError>> + Send;
}
