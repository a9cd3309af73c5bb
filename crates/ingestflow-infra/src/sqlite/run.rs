//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `ingestflow-core` using sqlx with split
//! read/write pools. Runs are updated in place; log entries are append-only.

use chrono::{DateTime, Utc};
use ingestflow_core::repository::run::RunRepository;
use ingestflow_types::error::RepositoryError;
use ingestflow_types::run::{DownloadLog, DownloadRun, LogStatus, RunStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    task_id: i64,
    workflow_id: i64,
    status: String,
    start_time: Option<String>,
    end_time: Option<String>,
    progress: i64,
    total_records: i64,
    success_records: i64,
    fail_records: i64,
    error_message: Option<String>,
    created_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            progress: row.try_get("progress")?,
            total_records: row.try_get("total_records")?,
            success_records: row.try_get("success_records")?,
            fail_records: row.try_get("fail_records")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_run(self) -> Result<DownloadRun, RepositoryError> {
        let status: RunStatus = serde_json::from_value(serde_json::Value::String(self.status.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid run status: {}", self.status)))?;

        Ok(DownloadRun {
            id: parse_uuid(&self.id)?,
            task_id: self.task_id,
            workflow_id: self.workflow_id,
            status,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            progress: self.progress.clamp(0, 100) as u8,
            total_records: self.total_records,
            success_records: self.success_records,
            fail_records: self.fail_records,
            error_message: self.error_message,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct LogRow {
    id: String,
    run_id: String,
    task_id: i64,
    label: String,
    config_id: Option<i64>,
    api_name: Option<String>,
    download_date: Option<String>,
    record_count: i64,
    status: String,
    error_message: Option<String>,
    file_path: Option<String>,
    duration_seconds: f64,
    created_at: String,
}

impl LogRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            task_id: row.try_get("task_id")?,
            label: row.try_get("label")?,
            config_id: row.try_get("config_id")?,
            api_name: row.try_get("api_name")?,
            download_date: row.try_get("download_date")?,
            record_count: row.try_get("record_count")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            file_path: row.try_get("file_path")?,
            duration_seconds: row.try_get("duration_seconds")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_log(self) -> Result<DownloadLog, RepositoryError> {
        let status: LogStatus = serde_json::from_value(serde_json::Value::String(self.status.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid log status: {}", self.status)))?;

        Ok(DownloadLog {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            task_id: self.task_id,
            label: self.label,
            config_id: self.config_id,
            api_name: self.api_name,
            download_date: self.download_date,
            record_count: self.record_count,
            status,
            error_message: self.error_message,
            file_path: self.file_path,
            duration_seconds: self.duration_seconds,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &DownloadRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO download_runs
               (id, task_id, workflow_id, status, start_time, end_time, progress,
                total_records, success_records, fail_records, error_message, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.task_id)
        .bind(run.workflow_id)
        .bind(run.status.to_string())
        .bind(run.start_time.as_ref().map(format_datetime))
        .bind(run.end_time.as_ref().map(format_datetime))
        .bind(run.progress as i64)
        .bind(run.total_records)
        .bind(run.success_records)
        .bind(run.fail_records)
        .bind(&run.error_message)
        .bind(format_datetime(&run.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn update_run(&self, run: &DownloadRun) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE download_runs SET
                 status = ?, start_time = ?, end_time = ?, progress = ?,
                 total_records = ?, success_records = ?, fail_records = ?, error_message = ?
               WHERE id = ?"#,
        )
        .bind(run.status.to_string())
        .bind(run.start_time.as_ref().map(format_datetime))
        .bind(run.end_time.as_ref().map(format_datetime))
        .bind(run.progress as i64)
        .bind(run.total_records)
        .bind(run.success_records)
        .bind(run.fail_records)
        .bind(&run.error_message)
        .bind(run.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<DownloadRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM download_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(
        &self,
        task_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<DownloadRun>, RepositoryError> {
        let rows = match task_id {
            Some(task_id) => {
                sqlx::query(
                    "SELECT * FROM download_runs WHERE task_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(task_id)
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM download_runs ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                RunRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_run()
            })
            .collect()
    }

    async fn append_logs(&self, logs: &[DownloadLog]) -> Result<(), RepositoryError> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for log in logs {
            sqlx::query(
                r#"INSERT INTO download_logs
                   (id, run_id, task_id, label, config_id, api_name, download_date,
                    record_count, status, error_message, file_path, duration_seconds, created_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(log.id.to_string())
            .bind(log.run_id.to_string())
            .bind(log.task_id)
            .bind(&log.label)
            .bind(log.config_id)
            .bind(&log.api_name)
            .bind(&log.download_date)
            .bind(log.record_count)
            .bind(log.status.to_string())
            .bind(&log.error_message)
            .bind(&log.file_path)
            .bind(log.duration_seconds)
            .bind(format_datetime(&log.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))
    }

    async fn list_logs(&self, run_id: &Uuid) -> Result<Vec<DownloadLog>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM download_logs WHERE run_id = ? ORDER BY created_at ASC, id ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                LogRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_log()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
