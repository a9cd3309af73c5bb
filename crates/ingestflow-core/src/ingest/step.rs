//! Step executor: one client invocation for one concrete parameter set.
//!
//! Invokes the client under a timeout, projects the result to the
//! ApiConfig's field allow-list, ensures the target table and unique index,
//! and merges the batch. Audit entries are appended to a caller-owned buffer
//! so they can be persisted after the step transaction ends.
//!
//! When the task has a `save_path` the projected batch is also exported to
//! disk; an export failure is logged and does not fail the step.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ingestflow_types::error::StoreError;
use ingestflow_types::run::DownloadLog;
use ingestflow_types::schema::Record;
use ingestflow_types::workflow::{ApiConfig, IngestTask, WorkflowStep, WriteMode};
use tokio_util::sync::CancellationToken;

use super::client::{ClientError, DataSourceClient};
use super::export::{export_file_name, export_records};
use super::merge::{Bookkeeping, MergeEngine, MergeOutcome, prepare_batch};
use super::schema::SchemaManager;
use super::tracker::{AuditContext, step_label};
use crate::repository::table::TableTransaction;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the error must stop the whole run rather than one execution.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::Store(e) if e.is_fatal())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Step override, else the task's default table, else `ingest_{api_code}`.
pub fn resolve_table_name(step: &WorkflowStep, task: &IngestTask, api: &ApiConfig) -> String {
    step.target_table_name
        .as_deref()
        .or(task.default_table_name.as_deref())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("ingest_{}", api.api_code))
}

/// Step write mode, else the ApiConfig default, else `Insert`.
pub fn effective_write_mode(step: &WorkflowStep, api: &ApiConfig) -> WriteMode {
    step.write_mode
        .or(api.default_write_mode)
        .unwrap_or_default()
}

/// Layer request parameters: api template, then the combination, then task
/// parameters.
pub fn build_request_params(api: &ApiConfig, combination: &Record, task: &IngestTask) -> Record {
    let mut params = api.request_param_template.clone();
    params.extend(combination.iter().map(|(k, v)| (k.clone(), v.clone())));
    params.extend(task.task_params.iter().map(|(k, v)| (k.clone(), v.clone())));
    params
}

/// Keep only allow-listed fields. An empty allow-list, or one that matches
/// none of the returned fields, keeps every field.
pub fn project_fields(records: Vec<Record>, allow_list: &[String]) -> Vec<Record> {
    if allow_list.is_empty() {
        return records;
    }
    let any_allowed = records
        .iter()
        .any(|r| allow_list.iter().any(|f| r.contains_key(f)));
    if !any_allowed {
        tracing::warn!(allow_list = ?allow_list, "no allow-listed field present in result, keeping all fields");
        return records;
    }
    records
        .into_iter()
        .map(|mut r| {
            r.retain(|k, _| allow_list.contains(k));
            r
        })
        .collect()
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Everything one execution needs to know.
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub task: &'a IngestTask,
    pub step: &'a WorkflowStep,
    pub api: &'a ApiConfig,
    /// Fully layered request parameters.
    pub params: &'a Record,
    /// Set for loop combinations (1-based).
    pub combo_index: Option<usize>,
}

impl StepRequest<'_> {
    pub fn label(&self) -> String {
        step_label(&self.task.task_name, &self.step.step_name, self.combo_index)
    }
}

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub table: String,
    /// Rows written (post-merge), or rows downloaded when the task does not
    /// save to the database. Zero for an empty result.
    pub record_count: i64,
    /// Projected result rows, for the result cache.
    pub records: Vec<Record>,
    pub merge: Option<MergeOutcome>,
    /// Export file, when the batch was saved to disk.
    pub file_path: Option<PathBuf>,
}

pub struct StepExecutor<C: DataSourceClient> {
    client: Arc<C>,
    schema: SchemaManager,
    merge: MergeEngine,
    client_timeout: Duration,
}

impl<C: DataSourceClient> StepExecutor<C> {
    pub fn new(client: Arc<C>, schema: SchemaManager, client_timeout: Duration) -> Self {
        Self {
            client,
            schema,
            merge: MergeEngine::new(),
            client_timeout,
        }
    }

    /// Execute and record the attempt in `logs`.
    ///
    /// Failures always produce a log entry embedding the error, parameters
    /// and api code; successes only when `log_success` is set. Cancellation
    /// produces no entry.
    pub async fn run<T: TableTransaction>(
        &self,
        tx: &mut T,
        request: StepRequest<'_>,
        audit: &AuditContext,
        logs: &mut Vec<DownloadLog>,
        log_success: bool,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        let started = Instant::now();
        let result = self.execute(tx, request, cancel).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(output) => {
                if log_success {
                    let mut entry = audit.success(
                        request.label(),
                        Some(request.api),
                        output.record_count,
                        elapsed,
                    );
                    entry.file_path = output.file_path.as_ref().map(|p| p.display().to_string());
                    logs.push(entry);
                }
            }
            Err(StepError::Cancelled) => {}
            Err(e) => {
                let params = serde_json::to_string(request.params).unwrap_or_default();
                let message = format!(
                    "step {} failed: {e}\nparams: {params}\napi_code: {}\napi_name: {}",
                    request.step.step_name, request.api.api_code, request.api.api_name
                );
                tracing::error!(
                    step = %request.step.step_name,
                    combo = ?request.combo_index,
                    api_code = %request.api.api_code,
                    error = %e,
                    "step execution failed"
                );
                logs.push(audit.failure(request.label(), Some(request.api), 0, &message, elapsed));
            }
        }
        result
    }

    /// Invoke the client and merge the result into the target table.
    pub async fn execute<T: TableTransaction>(
        &self,
        tx: &mut T,
        request: StepRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        let StepRequest {
            task, step, api, ..
        } = request;

        tracing::debug!(
            step = %step.step_name,
            combo = ?request.combo_index,
            api_code = %api.api_code,
            params = ?request.params,
            "invoking client"
        );

        let secs = self.client_timeout.as_secs();
        let records = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            res = tokio::time::timeout(self.client_timeout, self.client.invoke(&api.api_code, request.params)) => {
                res.map_err(|_| ClientError::Timeout(secs))??
            }
        };

        let table = resolve_table_name(step, task, api);
        if records.is_empty() {
            tracing::warn!(step = %step.step_name, combo = ?request.combo_index, "client returned no data");
            return Ok(StepOutput {
                table,
                record_count: 0,
                records,
                merge: None,
                file_path: None,
            });
        }

        let records = project_fields(records, &api.data_fields);
        let file_path = self.export(request, &records).await;
        if !task.output.save_to_db {
            return Ok(StepOutput {
                table,
                record_count: records.len() as i64,
                records,
                merge: None,
                file_path,
            });
        }

        let ensured = self
            .schema
            .ensure_table(tx, &table, &records, &api.primary_key_fields)
            .await?;
        let key = self
            .schema
            .resolve_unique_key(tx, &table, &step.unique_key_fields, &api.primary_key_fields)
            .await?;

        let bookkeeping = Bookkeeping {
            task_id: task.task_id,
            config_id: api.id,
            api_code: api.api_code.clone(),
            download_date: task.download_date.clone(),
        };
        let batch = prepare_batch(&table, &records, &ensured.columns, &bookkeeping);

        let mode = effective_write_mode(step, api);
        let key_fields: Vec<String> = key
            .fields
            .iter()
            .filter(|f| batch.columns.contains(f))
            .cloned()
            .collect();
        if mode.requires_unique_key() && !key_fields.is_empty() {
            self.schema.ensure_unique_index(tx, &table, &key_fields).await?;
        }

        let outcome = self.merge.write(tx, &table, &batch, mode, &key.fields).await?;
        tracing::debug!(
            step = %step.step_name,
            table = %table,
            mode = %outcome.mode,
            key_source = %key.source,
            written = outcome.written,
            "batch merged"
        );

        Ok(StepOutput {
            table,
            record_count: outcome.written as i64,
            records,
            merge: Some(outcome),
            file_path,
        })
    }

    /// Save the batch under the task's `save_path`, if any.
    async fn export(&self, request: StepRequest<'_>, records: &[Record]) -> Option<PathBuf> {
        let output = &request.task.output;
        let dir = output.save_path.as_deref()?;
        let name = export_file_name(
            &request.api.api_code,
            request.step.step_order,
            &request.task.download_date,
            chrono::Local::now().time(),
            request.combo_index,
            output.save_format,
        );
        match export_records(dir, &name, output.save_format, records).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(
                    step = %request.step.step_name,
                    dir = %dir.display(),
                    error = %e,
                    "batch export failed"
                );
                None
            }
        }
    }
}
