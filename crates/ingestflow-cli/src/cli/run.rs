//! `ingestflow run` and `ingestflow validate`.
//!
//! Runs a workflow definition file for one task against the fixture client
//! and prints a per-step summary. With `--api` only that ApiConfig from the
//! file's catalog is downloaded. Ctrl+C cancels the run between executions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio_util::sync::CancellationToken;

use ingestflow_core::ingest::definition::load_definition_file;
use ingestflow_core::ingest::orchestrator::{RunReport, StepOutcome};
use ingestflow_infra::engine::build_engine;
use ingestflow_infra::fixture::FixtureClient;
use ingestflow_types::run::RunStatus;
use ingestflow_types::schema::Record;
use ingestflow_types::workflow::{IngestTask, SaveFormat, TaskOutput, WorkflowDefinition};

use super::history::format_run_status;
use crate::state::AppState;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow YAML file.
    pub file: PathBuf,

    /// Task id recorded on the run and stamped onto written rows.
    #[arg(long, default_value = "1")]
    pub task_id: i64,

    /// Task name used in log labels (defaults to the workflow name).
    #[arg(long)]
    pub task_name: Option<String>,

    /// Default target table for steps without an override.
    #[arg(long)]
    pub table: Option<String>,

    /// Task parameters as a JSON object; they override every other layer.
    #[arg(long)]
    pub params: Option<String>,

    /// Directory holding `{api_code}.json` fixtures.
    #[arg(long)]
    pub fixtures: Option<PathBuf>,

    /// Download date as YYYYMMDD; anchors `today` expressions (defaults to today).
    #[arg(long)]
    pub date: Option<String>,

    /// Download only the ApiConfig with this id instead of running the workflow.
    #[arg(long = "api", value_name = "CONFIG_ID")]
    pub config_id: Option<i64>,

    /// Also export every batch into this directory.
    #[arg(long)]
    pub save_path: Option<PathBuf>,

    /// Export format: csv or json. Unknown formats fall back to csv.
    #[arg(long, default_value = "csv")]
    pub save_format: String,

    /// Skip writing batches to the database.
    #[arg(long)]
    pub no_db: bool,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(args: RunArgs, state: &AppState, json: bool) -> Result<()> {
    let definition = load_definition_file(&args.file)
        .with_context(|| format!("Failed to load workflow {}", args.file.display()))?;
    let today = match args.date.as_deref() {
        Some(raw) => parse_download_date(raw)?,
        None => chrono::Local::now().date_naive(),
    };
    let task = build_task(&args, &definition, today)?;

    let fixtures = args.fixtures.clone().unwrap_or_else(|| state.fixtures_dir());
    let client = Arc::new(FixtureClient::new(&fixtures));
    let engine = build_engine(state.db_pool.clone(), client, state.config.clone())?;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    tracing::info!(
        workflow = %definition.workflow.name,
        task_id = task.task_id,
        fixtures = %fixtures.display(),
        "starting run"
    );
    let result = engine.run(&definition, &task, today, &cancel).await;
    ctrl_c.abort();
    let report = result.context("Failed to record the run")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else {
        print_report(&definition, &report);
    }

    if report.run.status != RunStatus::Success {
        bail!("run {} finished as {}", report.run.id, report.run.status);
    }
    Ok(())
}

fn parse_download_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y%m%d")
        .with_context(|| format!("Invalid date '{raw}', expected YYYYMMDD"))
}

/// Assemble the task context from command-line arguments.
fn build_task(args: &RunArgs, definition: &WorkflowDefinition, today: NaiveDate) -> Result<IngestTask> {
    let task_params: Record = match args.params.as_deref() {
        Some(raw) => match serde_json::from_str::<serde_json::Value>(raw)
            .with_context(|| "Invalid JSON in --params")?
        {
            serde_json::Value::Object(map) => map,
            other => bail!("--params must be a JSON object, got {other}"),
        },
        None => Record::new(),
    };

    let save_format = SaveFormat::from_code(&args.save_format).unwrap_or_else(|| {
        tracing::warn!(format = %args.save_format, "unsupported save format, using csv");
        SaveFormat::Csv
    });

    Ok(IngestTask {
        task_id: args.task_id,
        task_name: args
            .task_name
            .clone()
            .unwrap_or_else(|| definition.workflow.name.clone()),
        workflow_id: definition.workflow.id,
        default_table_name: args.table.clone(),
        task_params,
        download_date: today.format("%Y%m%d").to_string(),
        config_id: args.config_id,
        output: TaskOutput {
            save_to_db: !args.no_db,
            save_path: args.save_path.clone(),
            save_format,
        },
    })
}

fn outcome_label(outcome: StepOutcome) -> String {
    match outcome {
        StepOutcome::Skipped(reason) => format!("skipped ({reason})"),
        StepOutcome::Executed { failed: false } => "ok".to_string(),
        StepOutcome::Executed { failed: true } => "failed".to_string(),
    }
}

fn report_json(report: &RunReport) -> serde_json::Value {
    let run = &report.run;
    serde_json::json!({
        "run_id": run.id.to_string(),
        "task_id": run.task_id,
        "workflow_id": run.workflow_id,
        "status": run.status.to_string(),
        "progress": run.progress,
        "total_records": run.total_records,
        "success_records": run.success_records,
        "fail_records": run.fail_records,
        "start_time": run.start_time.map(|t| t.to_rfc3339()),
        "end_time": run.end_time.map(|t| t.to_rfc3339()),
        "error": run.error_message,
        "steps": report.steps.iter().map(|s| serde_json::json!({
            "step": s.step_name,
            "outcome": outcome_label(s.outcome),
            "combinations": s.combinations,
            "records": s.record_count,
            "error": s.error,
        })).collect::<Vec<_>>(),
    })
}

fn print_report(definition: &WorkflowDefinition, report: &RunReport) {
    let run = &report.run;

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Outcome"),
            Cell::new("Combinations"),
            Cell::new("Records"),
        ]);
    for step in &report.steps {
        let outcome = match step.outcome {
            StepOutcome::Skipped(_) => Cell::new(outcome_label(step.outcome)).fg(Color::DarkGrey),
            StepOutcome::Executed { failed: false } => Cell::new("ok").fg(Color::Green),
            StepOutcome::Executed { failed: true } => Cell::new("failed").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(&step.step_name),
            outcome,
            Cell::new(step.combinations),
            Cell::new(step.record_count),
        ]);
    }

    println!();
    println!(
        "  {} Workflow '{}' run {}",
        style("*").green().bold(),
        style(&definition.workflow.name).cyan(),
        style(run.id).dim()
    );
    println!();
    if !report.steps.is_empty() {
        println!("{table}");
        println!();
    }
    println!("  Status:   {}", format_run_status(run.status));
    println!("  Progress: {}%", run.progress);
    println!(
        "  Records:  {} total, {} succeeded",
        run.total_records, run.success_records
    );
    if let Some(err) = &run.error_message {
        println!("  Error:    {}", style(err).red());
    }
    println!();
    println!(
        "  Audit log: {}",
        style(format!("ingestflow logs {}", run.id)).dim()
    );
    println!();
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let definition = load_definition_file(file)
        .with_context(|| format!("Failed to load workflow {}", file.display()))?;
    let workflow = &definition.workflow;

    if json {
        let out = serde_json::json!({
            "workflow": workflow.name,
            "enabled": workflow.is_enabled(),
            "steps": workflow.ordered_steps().iter().map(|s| serde_json::json!({
                "step": s.step_name,
                "order": s.step_order,
                "node_type": s.node_type.to_string(),
                "loop_mode": s.loop_mode,
                "api_id": s.source_api_id,
            })).collect::<Vec<_>>(),
            "api_configs": definition.api_configs.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Step"),
            Cell::new("Type"),
            Cell::new("Api"),
            Cell::new("Write mode"),
            Cell::new("Loop"),
        ]);
    for step in workflow.ordered_steps() {
        let api = step
            .source_api_id
            .and_then(|id| definition.api_config(id))
            .map(|a| a.api_code.clone())
            .unwrap_or_else(|| "-".to_string());
        let mode = step
            .write_mode
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(step.step_order),
            Cell::new(&step.step_name),
            Cell::new(step.node_type.to_string()),
            Cell::new(api),
            Cell::new(mode),
            Cell::new(if step.loop_mode { "yes" } else { "" }),
        ]);
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("*").green().bold(),
        style(&workflow.name).cyan()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestflow_core::ingest::definition::parse_definition_yaml;

    fn args(params: Option<&str>) -> RunArgs {
        RunArgs {
            file: PathBuf::from("daily.yaml"),
            task_id: 4,
            task_name: None,
            table: Some("quotes".to_string()),
            params: params.map(str::to_string),
            fixtures: None,
            date: None,
            config_id: None,
            save_path: None,
            save_format: "csv".to_string(),
            no_db: false,
        }
    }

    fn definition() -> WorkflowDefinition {
        parse_definition_yaml("workflow:\n  id: 9\n  name: daily\n").unwrap()
    }

    #[test]
    fn build_task_uses_workflow_name_and_date() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let task = build_task(&args(Some(r#"{"limit": 100}"#)), &definition(), today).unwrap();
        assert_eq!(task.task_id, 4);
        assert_eq!(task.task_name, "daily");
        assert_eq!(task.workflow_id, 9);
        assert_eq!(task.default_table_name.as_deref(), Some("quotes"));
        assert_eq!(task.download_date, "20240305");
        assert_eq!(task.task_params["limit"], 100);
    }

    #[test]
    fn build_task_rejects_non_object_params() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(build_task(&args(Some("[1, 2]")), &definition(), today).is_err());
        assert!(build_task(&args(Some("{oops")), &definition(), today).is_err());
    }

    #[test]
    fn build_task_carries_output_options() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let mut args = args(None);
        args.config_id = Some(11);
        args.save_path = Some(PathBuf::from("/tmp/exports"));
        args.save_format = "Excel".to_string();
        args.no_db = true;

        let task = build_task(&args, &definition(), today).unwrap();
        assert_eq!(task.config_id, Some(11));
        assert!(!task.output.save_to_db);
        assert_eq!(task.output.save_path, Some(PathBuf::from("/tmp/exports")));
        assert_eq!(task.output.save_format, SaveFormat::Csv);

        args.save_format = "json".to_string();
        let task = build_task(&args, &definition(), today).unwrap();
        assert_eq!(task.output.save_format, SaveFormat::Json);
    }

    #[test]
    fn download_date_format() {
        assert_eq!(
            parse_download_date("20240102").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
        );
        assert!(parse_download_date("2024-01-02").is_err());
    }

    #[test]
    fn outcome_labels() {
        use ingestflow_core::ingest::orchestrator::SkipReason;
        assert_eq!(outcome_label(StepOutcome::Executed { failed: false }), "ok");
        assert_eq!(
            outcome_label(StepOutcome::Skipped(SkipReason::ConditionFalse)),
            "skipped (condition false)"
        );
    }
}
