//! `ingestflow runs`, `ingestflow show` and `ingestflow logs`.
//!
//! Read-only views over the run and audit tables.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use ingestflow_core::repository::run::RunRepository;
use ingestflow_types::run::{DownloadLog, DownloadRun, LogStatus, RunStatus};

/// Longest error excerpt shown in a table cell.
const ERROR_PREVIEW_CHARS: usize = 60;

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

pub async fn handle_runs(
    task_id: Option<i64>,
    limit: u32,
    repo: &impl RunRepository,
    json: bool,
) -> Result<()> {
    let runs = repo
        .list_runs(task_id, limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list runs: {e}"))?;

    if json {
        let out: Vec<_> = runs.iter().map(run_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded.");
        println!(
            "  Start one with: {}",
            style("ingestflow run <workflow.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Task"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Records"),
            Cell::new("Started"),
            Cell::new("Error"),
        ]);

    for r in &runs {
        let started = r
            .start_time
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(r.id.to_string().chars().take(8).collect::<String>()),
            Cell::new(r.task_id),
            format_status_cell(r.status),
            Cell::new(format!("{}%", r.progress)),
            Cell::new(r.total_records),
            Cell::new(started),
            Cell::new(preview(r.error_message.as_deref())),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn handle_show(run_id_str: &str, repo: &impl RunRepository, json: bool) -> Result<()> {
    let run_id: uuid::Uuid = run_id_str
        .parse()
        .with_context(|| format!("Invalid run ID: '{run_id_str}'"))?;
    let run = repo
        .get_run(&run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get run: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run_json(&run))?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Run").bold(),
        style(run.id).cyan()
    );
    println!("  Task: {}  Workflow: {}", run.task_id, run.workflow_id);
    println!("  Status: {}", format_run_status(run.status));
    println!("  Progress: {}%", run.progress);
    println!(
        "  Records: {} total, {} succeeded, {} failed",
        run.total_records, run.success_records, run.fail_records
    );
    if let Some(start) = run.start_time {
        println!("  Started: {}", start.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(end) = run.end_time {
        println!("  Finished: {}", end.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = run.error_message {
        println!("  Error: {}", style(err).red());
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

pub async fn handle_logs(run_id_str: &str, repo: &impl RunRepository, json: bool) -> Result<()> {
    let run_id: uuid::Uuid = run_id_str
        .parse()
        .with_context(|| format!("Invalid run ID: '{run_id_str}'"))?;

    let logs = repo
        .list_logs(&run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list logs: {e}"))?;

    if json {
        let out: Vec<_> = logs.iter().map(log_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if logs.is_empty() {
        println!();
        println!("  No log entries for run '{run_id}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Label").fg(Color::Cyan),
            Cell::new("Api"),
            Cell::new("Status"),
            Cell::new("Records"),
            Cell::new("Duration"),
            Cell::new("Detail"),
        ]);

    for l in &logs {
        let status = match l.status {
            LogStatus::Success => Cell::new("success").fg(Color::Green),
            LogStatus::Fail => Cell::new("fail").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(&l.label),
            Cell::new(l.api_name.as_deref().unwrap_or("-")),
            status,
            Cell::new(l.record_count),
            Cell::new(format!("{:.2}s", l.duration_seconds)),
            Cell::new(preview(l.error_message.as_deref())),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn run_json(r: &DownloadRun) -> serde_json::Value {
    serde_json::json!({
        "run_id": r.id.to_string(),
        "task_id": r.task_id,
        "workflow_id": r.workflow_id,
        "status": r.status.to_string(),
        "progress": r.progress,
        "total_records": r.total_records,
        "success_records": r.success_records,
        "fail_records": r.fail_records,
        "start_time": r.start_time.map(|t| t.to_rfc3339()),
        "end_time": r.end_time.map(|t| t.to_rfc3339()),
        "error": r.error_message,
    })
}

fn log_json(l: &DownloadLog) -> serde_json::Value {
    serde_json::json!({
        "label": l.label,
        "config_id": l.config_id,
        "api_name": l.api_name,
        "download_date": l.download_date,
        "status": l.status.to_string(),
        "record_count": l.record_count,
        "duration_seconds": l.duration_seconds,
        "message": l.error_message,
        "file_path": l.file_path,
        "created_at": l.created_at.to_rfc3339(),
    })
}

/// First line of `text`, cut to a table-friendly width.
fn preview(text: Option<&str>) -> String {
    let Some(text) = text else {
        return String::new();
    };
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > ERROR_PREVIEW_CHARS {
        let cut: String = line.chars().take(ERROR_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

fn format_status_cell(status: RunStatus) -> Cell {
    match status {
        RunStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        RunStatus::Running => Cell::new("running").fg(Color::Blue),
        RunStatus::Success => Cell::new("success").fg(Color::Green),
        RunStatus::Failed => Cell::new("failed").fg(Color::Red),
        RunStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
        RunStatus::TimedOut => Cell::new("timed_out").fg(Color::Magenta),
    }
}

pub fn format_run_status(status: RunStatus) -> String {
    let label = status.to_string();
    match status {
        RunStatus::Success => style(label).green().to_string(),
        RunStatus::Failed | RunStatus::TimedOut => style(label).red().to_string(),
        RunStatus::Cancelled => style(label).yellow().to_string(),
        RunStatus::Pending | RunStatus::Running => style(label).blue().to_string(),
    }
}
