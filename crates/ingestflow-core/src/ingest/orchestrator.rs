//! Workflow orchestrator: runs a task's workflow steps in order.
//!
//! One `run_task` call is one `DownloadRun`. Steps execute strictly in
//! `step_order`; each task step gets its own transaction, which is committed
//! before the next step begins.
//!
//! # Execution flow
//!
//! 1. Create the run (`Pending`), refuse disabled workflows, move to `Running`.
//! 2. For each task step: skip disabled steps and unusable api configs,
//!    classify and resolve parameters against the run's `ResultCache`, and
//!    expand them into combinations.
//! 3. Non-loop step: evaluate the condition, execute once inside a savepoint.
//! 4. Loop step: evaluate the condition per combination and execute each
//!    combination inside its own savepoint, so a failing combination never
//!    undoes its siblings. One loop summary entry is logged afterwards.
//! 5. Commit the step transaction, flush buffered audit entries, publish
//!    non-empty results to the cache, update progress.
//! 6. Finish the run in a terminal state, whatever happened above.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use ingestflow_types::config::EngineConfig;
use ingestflow_types::error::StoreError;
use ingestflow_types::run::{DownloadLog, DownloadRun, RunCounts, RunStatus};
use ingestflow_types::schema::Record;
use ingestflow_types::workflow::{ApiConfig, IngestTask, WorkflowDefinition, WorkflowStep};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::cache::ResultCache;
use super::client::DataSourceClient;
use super::combination::{CombinationSet, generate_combinations};
use super::condition::ConditionEvaluator;
use super::resolver::{ResolvedParam, classify_params, resolve_bindings};
use super::schema::SchemaManager;
use super::step::{StepError, StepExecutor, StepOutput, StepRequest, build_request_params};
use super::summary::{ComboDetail, ComboStatus, LoopSummary};
use super::tracker::{AuditContext, RunTracker, TrackerError, loop_summary_label};
use crate::repository::run::RunRepository;
use crate::repository::table::{TableStore, TableTransaction};

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

/// Errors that stop a run.
///
/// Only `Tracker` errors escape [`WorkflowOrchestrator::run_task`]; the rest
/// are recorded on the run as its terminal state.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("run tracking failed: {0}")]
    Tracker(#[from] TrackerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("step aborted the run: {0}")]
    Step(StepError),

    #[error("run cancelled")]
    Cancelled,
}

impl From<StepError> for OrchestratorError {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Cancelled => OrchestratorError::Cancelled,
            other => OrchestratorError::Step(other),
        }
    }
}

/// Why a step did not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Start or end marker.
    NoOp,
    Disabled,
    /// Missing or disabled api config.
    ApiUnavailable,
    ConditionFalse,
    /// A loop binding resolved to no values.
    NoCombinations,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::NoOp => "no-op node",
            SkipReason::Disabled => "disabled",
            SkipReason::ApiUnavailable => "api config unavailable",
            SkipReason::ConditionFalse => "condition false",
            SkipReason::NoCombinations => "no combinations",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Skipped(SkipReason),
    Executed { failed: bool },
}

/// What happened to one workflow step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step_name: String,
    pub outcome: StepOutcome,
    /// Executions attempted (1 for a non-loop step).
    pub combinations: usize,
    pub record_count: i64,
    pub error: Option<String>,
}

impl StepReport {
    fn skipped(step: &WorkflowStep, reason: SkipReason) -> Self {
        Self {
            step_name: step.step_name.clone(),
            outcome: StepOutcome::Skipped(reason),
            combinations: 0,
            record_count: 0,
            error: None,
        }
    }
}

/// Final state of a run plus per-step detail.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: DownloadRun,
    pub steps: Vec<StepReport>,
}

// ---------------------------------------------------------------------------
// Run-scoped state
// ---------------------------------------------------------------------------

struct RunContext<'a> {
    definition: &'a WorkflowDefinition,
    task: &'a IngestTask,
    today: NaiveDate,
    cancel: &'a CancellationToken,
    audit: AuditContext,
}

#[derive(Default)]
struct RunState {
    cache: ResultCache,
    previous_step: Option<String>,
    logs: Vec<DownloadLog>,
    total_records: i64,
    failed: bool,
    last_error: Option<String>,
    steps: Vec<StepReport>,
}

impl RunState {
    fn record_failure(&mut self, message: String) {
        self.failed = true;
        self.last_error = Some(message);
    }

    /// Publish a step's rows and make it the `previous_step`.
    fn publish(&mut self, step: &str, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        self.cache.publish(step, records);
        self.previous_step = Some(step.to_string());
    }
}

/// Map how the step loop ended to the run's terminal status and error.
fn terminal_state(
    outcome: &Result<(), OrchestratorError>,
    state: &RunState,
    externally_cancelled: bool,
    run_timeout_secs: Option<u64>,
) -> (RunStatus, Option<String>) {
    match outcome {
        Ok(()) if state.failed => (RunStatus::Failed, state.last_error.clone()),
        Ok(()) => (RunStatus::Success, None),
        Err(OrchestratorError::Cancelled) if externally_cancelled => {
            (RunStatus::Cancelled, Some("run cancelled".to_string()))
        }
        Err(OrchestratorError::Cancelled) => (
            RunStatus::TimedOut,
            Some(format!(
                "run exceeded its {}s timeout",
                run_timeout_secs.unwrap_or_default()
            )),
        ),
        Err(e) => (RunStatus::Failed, Some(e.to_string())),
    }
}

fn run_counts(status: RunStatus, total_records: i64) -> RunCounts {
    let succeeded = status == RunStatus::Success;
    RunCounts {
        total_records,
        success_records: if succeeded { total_records } else { 0 },
        fail_records: if succeeded { 0 } else { 1 },
    }
}

/// Evaluate the step condition for `params`. Evaluation errors execute
/// the step anyway.
fn condition_allows(
    step: &WorkflowStep,
    cache: &ResultCache,
    params: &Record,
    combo_index: Option<usize>,
) -> bool {
    let Some(expr) = step.condition_expr.as_deref() else {
        return true;
    };
    let evaluator = ConditionEvaluator::new();
    match evaluator.should_execute(expr, cache, &Value::Object(params.clone())) {
        Ok(allowed) => allowed,
        Err(e) => {
            tracing::warn!(
                step = %step.step_name,
                combo = ?combo_index,
                error = %e,
                "condition evaluation failed, executing anyway"
            );
            true
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowOrchestrator
// ---------------------------------------------------------------------------

/// Sequential workflow runner.
///
/// Generic over the target-table store, the run repository and the upstream
/// client so that storage and transport stay swappable.
pub struct WorkflowOrchestrator<S: TableStore, R: RunRepository, C: DataSourceClient> {
    store: S,
    runs: R,
    executor: StepExecutor<C>,
    config: EngineConfig,
}

impl<S, R, C> WorkflowOrchestrator<S, R, C>
where
    S: TableStore,
    R: RunRepository,
    C: DataSourceClient,
{
    pub fn new(store: S, runs: R, client: Arc<C>, config: EngineConfig) -> Self {
        let executor = StepExecutor::new(
            client,
            SchemaManager::new(config.text_column_length),
            Duration::from_secs(config.client_timeout_secs),
        );
        Self {
            store,
            runs,
            executor,
            config,
        }
    }

    pub fn runs(&self) -> &R {
        &self.runs
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run every step of `definition` for `task`.
    ///
    /// `today` anchors relative-date parameters. The run always ends in a
    /// terminal state; an `Err` is returned only when that state itself
    /// could not be persisted.
    pub async fn run_task(
        &self,
        definition: &WorkflowDefinition,
        task: &IngestTask,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let workflow = &definition.workflow;
        if !workflow.is_enabled() {
            let message = format!("workflow '{}' is disabled", workflow.name);
            return self.refuse(task, workflow.id, message).await;
        }

        let mut tracker = RunTracker::create(&self.runs, task.task_id, workflow.id).await?;
        tracker.start().await?;
        tracing::info!(
            run_id = %tracker.run_id(),
            workflow = %workflow.name,
            task = %task.task_name,
            download_date = %task.download_date,
            "running workflow"
        );

        let run_cancel = cancel.child_token();
        let timer = self.config.run_timeout_secs.map(|secs| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                token.cancel();
            })
        });

        let ctx = RunContext {
            definition,
            task,
            today,
            cancel: &run_cancel,
            audit: AuditContext::new(tracker.run_id(), task, self.config.max_error_message_len),
        };
        let mut state = RunState::default();
        let outcome = self.execute_steps(&ctx, &mut tracker, &mut state).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        if let Err(e) = tracker.flush_logs(&mut state.logs).await {
            tracing::warn!(error = %e, dropped = state.logs.len(), "could not persist remaining audit entries");
        }

        let (status, error) = terminal_state(
            &outcome,
            &state,
            cancel.is_cancelled(),
            self.config.run_timeout_secs,
        );
        if let Err(e) = &outcome {
            tracing::error!(run_id = %tracker.run_id(), error = %e, "run aborted");
        }
        tracker
            .finish(status, run_counts(status, state.total_records), error)
            .await?;

        Ok(RunReport {
            run: tracker.run().clone(),
            steps: state.steps,
        })
    }

    /// Run `task`: a task with a `config_id` downloads that api from the
    /// definition's catalog, any other task runs the workflow.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        task: &IngestTask,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let Some(config_id) = task.config_id else {
            return self.run_task(definition, task, today, cancel).await;
        };
        match definition.api_config(config_id) {
            Some(api) => self.run_single_api(api, task, today, cancel).await,
            None => {
                let message = format!("api config {config_id} not found");
                self.refuse(task, task.workflow_id, message).await
            }
        }
    }

    /// Download one api once, with its template and the task parameters,
    /// through the same step path a workflow uses.
    pub async fn run_single_api(
        &self,
        api: &ApiConfig,
        task: &IngestTask,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        if !api.is_enabled() {
            let message = format!("api config '{}' is disabled", api.api_code);
            return self.refuse(task, task.workflow_id, message).await;
        }
        let definition = WorkflowDefinition::single_api(api, task.workflow_id);
        self.run_task(&definition, task, today, cancel).await
    }

    /// Record a run that fails before it starts.
    async fn refuse(
        &self,
        task: &IngestTask,
        workflow_id: i64,
        message: String,
    ) -> Result<RunReport, OrchestratorError> {
        let mut tracker = RunTracker::create(&self.runs, task.task_id, workflow_id).await?;
        tracing::warn!(task = %task.task_name, reason = %message, "run not started");
        tracker
            .finish(RunStatus::Failed, RunCounts::default(), Some(message))
            .await?;
        Ok(RunReport {
            run: tracker.run().clone(),
            steps: Vec::new(),
        })
    }

    async fn execute_steps(
        &self,
        ctx: &RunContext<'_>,
        tracker: &mut RunTracker<'_, R>,
        state: &mut RunState,
    ) -> Result<(), OrchestratorError> {
        let steps = ctx.definition.workflow.ordered_steps();
        let task_steps = steps.iter().filter(|s| !s.node_type.is_noop()).count();
        let mut completed = 0;

        for step in steps {
            if ctx.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if step.node_type.is_noop() {
                state.steps.push(StepReport::skipped(step, SkipReason::NoOp));
                continue;
            }

            let report = self.execute_step(ctx, step, tracker, state).await?;
            let step_failed = matches!(report.outcome, StepOutcome::Executed { failed: true });
            tracing::info!(
                step = %report.step_name,
                outcome = ?report.outcome,
                records = report.record_count,
                "step finished"
            );
            state.steps.push(report);

            completed += 1;
            tracker.set_progress(completed, task_steps).await?;

            if step_failed && self.config.halt_on_step_failure {
                tracing::warn!(step = %step.step_name, "halting workflow after failed step");
                break;
            }
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        ctx: &RunContext<'_>,
        step: &WorkflowStep,
        tracker: &mut RunTracker<'_, R>,
        state: &mut RunState,
    ) -> Result<StepReport, OrchestratorError> {
        if !step.is_enabled() {
            tracing::warn!(step = %step.step_name, "step disabled, skipping");
            return Ok(StepReport::skipped(step, SkipReason::Disabled));
        }
        let Some(api) = step.source_api_id.and_then(|id| ctx.definition.api_config(id)) else {
            tracing::error!(step = %step.step_name, api_id = ?step.source_api_id, "api config not found, skipping step");
            return Ok(StepReport::skipped(step, SkipReason::ApiUnavailable));
        };
        if !api.is_enabled() {
            tracing::warn!(step = %step.step_name, api_code = %api.api_code, "api config disabled, skipping step");
            return Ok(StepReport::skipped(step, SkipReason::ApiUnavailable));
        }

        let sources = classify_params(&step.step_params, step.loop_mode, ctx.today);
        let resolved = resolve_bindings(&sources, &state.cache, state.previous_step.as_deref(), ctx.today);
        let combinations = generate_combinations(&resolved);

        if step.loop_mode {
            self.execute_loop(ctx, step, api, &resolved, combinations, tracker, state)
                .await
        } else {
            self.execute_single(ctx, step, api, combinations, tracker, state)
                .await
        }
    }

    async fn execute_single(
        &self,
        ctx: &RunContext<'_>,
        step: &WorkflowStep,
        api: &ApiConfig,
        combinations: CombinationSet,
        tracker: &mut RunTracker<'_, R>,
        state: &mut RunState,
    ) -> Result<StepReport, OrchestratorError> {
        let combination = combinations.combinations.into_iter().next().unwrap_or_default();
        let params = build_request_params(api, &combination, ctx.task);
        if !condition_allows(step, &state.cache, &params, None) {
            tracing::info!(step = %step.step_name, "condition false, skipping step");
            return Ok(StepReport::skipped(step, SkipReason::ConditionFalse));
        }

        let request = StepRequest {
            task: ctx.task,
            step,
            api,
            params: &params,
            combo_index: None,
        };
        let mut tx = self.store.begin().await?;
        let result = self
            .run_in_savepoint(&mut tx, request, ctx, &mut state.logs, true)
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) if e.is_fatal() => {
                drop(tx);
                return Err(e.into());
            }
            Err(e) => {
                tx.commit().await?;
                tracker.flush_logs(&mut state.logs).await?;
                if matches!(e, StepError::Cancelled) {
                    return Err(OrchestratorError::Cancelled);
                }
                let message = format!("step '{}' failed: {e}", step.step_name);
                state.record_failure(message.clone());
                return Ok(StepReport {
                    step_name: step.step_name.clone(),
                    outcome: StepOutcome::Executed { failed: true },
                    combinations: 1,
                    record_count: 0,
                    error: Some(message),
                });
            }
        };

        tx.commit().await?;
        tracker.flush_logs(&mut state.logs).await?;

        let StepOutput {
            record_count,
            records,
            ..
        } = output;
        state.total_records += record_count;
        state.publish(&step.step_name, records);

        Ok(StepReport {
            step_name: step.step_name.clone(),
            outcome: StepOutcome::Executed { failed: false },
            combinations: 1,
            record_count,
            error: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_loop(
        &self,
        ctx: &RunContext<'_>,
        step: &WorkflowStep,
        api: &ApiConfig,
        resolved: &[ResolvedParam],
        combinations: CombinationSet,
        tracker: &mut RunTracker<'_, R>,
        state: &mut RunState,
    ) -> Result<StepReport, OrchestratorError> {
        if combinations.combinations.is_empty() {
            tracing::warn!(
                step = %step.step_name,
                empty = ?combinations.empty_bindings,
                "loop produced no combinations, skipping step"
            );
            return Ok(StepReport::skipped(step, SkipReason::NoCombinations));
        }

        let total = combinations.combinations.len();
        tracing::info!(step = %step.step_name, combinations = total, "executing loop step");

        let started = Instant::now();
        let mut summary = LoopSummary::new(total, resolved, self.config.loop_summary_detail_limit);
        let mut batches: Vec<Vec<Record>> = Vec::new();
        let mut step_records = 0i64;
        let mut last_error: Option<String> = None;
        let mut cancelled = false;
        let mut tx = self.store.begin().await?;

        for (i, combination) in combinations.combinations.iter().enumerate() {
            let combo_index = i + 1;
            if ctx.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let params = build_request_params(api, combination, ctx.task);
            if !condition_allows(step, &state.cache, &params, Some(combo_index)) {
                tracing::debug!(step = %step.step_name, combo = combo_index, "condition false, skipping combination");
                summary.record(ComboDetail {
                    combo_index,
                    params: combination.clone(),
                    status: ComboStatus::Skipped,
                    record_count: None,
                    duration: None,
                    reason: Some("condition evaluated to false".to_string()),
                });
                continue;
            }

            let request = StepRequest {
                task: ctx.task,
                step,
                api,
                params: &params,
                combo_index: Some(combo_index),
            };
            let combo_started = Instant::now();
            let result = self
                .run_in_savepoint(&mut tx, request, ctx, &mut state.logs, false)
                .await;
            let duration = Some(combo_started.elapsed().as_secs_f64());

            match result {
                Ok(output) => {
                    let status = if output.records.is_empty() {
                        ComboStatus::Empty
                    } else {
                        ComboStatus::Success
                    };
                    step_records += output.record_count;
                    summary.record(ComboDetail {
                        combo_index,
                        params: combination.clone(),
                        status,
                        record_count: Some(output.record_count),
                        duration,
                        reason: None,
                    });
                    if !output.records.is_empty() {
                        batches.push(output.records);
                    }
                }
                Err(StepError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) if e.is_fatal() => {
                    drop(tx);
                    return Err(e.into());
                }
                Err(e) => {
                    summary.record(ComboDetail {
                        combo_index,
                        params: combination.clone(),
                        status: ComboStatus::Failed,
                        record_count: None,
                        duration,
                        reason: Some(e.to_string()),
                    });
                    last_error = Some(e.to_string());
                }
            }
        }

        let failed = summary.has_failures();
        let fail_count = summary.fail_count;
        let summary_json = summary.to_json(self.config.loop_summary_max_len);
        state.logs.push(ctx.audit.summary(
            loop_summary_label(&ctx.task.task_name, &step.step_name),
            Some(api),
            step_records,
            failed,
            summary_json,
            started.elapsed().as_secs_f64(),
        ));

        tx.commit().await?;
        tracker.flush_logs(&mut state.logs).await?;

        state.total_records += step_records;
        if !batches.is_empty() {
            let kept = state.cache.publish_merged(&step.step_name, batches);
            state.previous_step = Some(step.step_name.clone());
            tracing::debug!(step = %step.step_name, rows = kept, "published merged loop result");
        }

        if cancelled {
            return Err(OrchestratorError::Cancelled);
        }

        let error = last_error.map(|e| {
            format!(
                "step '{}' failed for {fail_count} of {total} combinations, last error: {e}",
                step.step_name
            )
        });
        if let Some(message) = &error {
            state.record_failure(message.clone());
        }

        Ok(StepReport {
            step_name: step.step_name.clone(),
            outcome: StepOutcome::Executed { failed },
            combinations: total,
            record_count: step_records,
            error,
        })
    }

    /// Run one execution inside a savepoint: released on success, rolled
    /// back on failure. Fatal errors leave the savepoint alone since the
    /// connection is gone.
    async fn run_in_savepoint(
        &self,
        tx: &mut S::Tx,
        request: StepRequest<'_>,
        ctx: &RunContext<'_>,
        logs: &mut Vec<DownloadLog>,
        log_success: bool,
    ) -> Result<StepOutput, StepError> {
        let savepoint = tx.savepoint().await?;
        match self
            .executor
            .run(tx, request, &ctx.audit, logs, log_success, ctx.cancel)
            .await
        {
            Ok(output) => {
                tx.release_savepoint(savepoint).await?;
                Ok(output)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tx.rollback_to_savepoint(savepoint).await?;
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
