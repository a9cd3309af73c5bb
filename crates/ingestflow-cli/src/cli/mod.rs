//! CLI command definitions for the `ingestflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod history;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run workflow-driven data ingestion into SQL tables.
#[derive(Parser)]
#[command(name = "ingestflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Database URL (defaults to `ingestflow.db` in the data directory).
    #[arg(long, global = true, env = "INGESTFLOW_DATABASE_URL")]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow definition file for one task.
    Run(run::RunArgs),

    /// Parse and validate a workflow definition file without running it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// List recent runs.
    Runs {
        /// Only show runs of this task.
        #[arg(long)]
        task_id: Option<i64>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one run.
    Show {
        /// Run UUID.
        run_id: String,
    },

    /// Show the audit log entries of a run.
    Logs {
        /// Run UUID.
        run_id: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
