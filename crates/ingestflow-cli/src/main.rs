//! ingestflow CLI entry point.
//!
//! Binary name: `ingestflow`
//!
//! Parses CLI arguments, sets up tracing, opens the database and dispatches
//! to the command handlers.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use ingestflow_observe::tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,ingestflow=debug",
        _ => "trace",
    };
    let options = TracingOptions {
        format: if cli.log_json { LogFormat::Json } else { LogFormat::Text },
        enable_otel: cli.otel,
        ..TracingOptions::new(filter)
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Commands that don't need app state
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "ingestflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::run::handle_validate(file, cli.json),
        _ => {}
    }

    let state = AppState::init(cli.database.as_deref()).await?;

    match cli.command {
        Commands::Run(args) => cli::run::handle_run(args, &state, cli.json).await,
        Commands::Runs { task_id, limit } => {
            cli::history::handle_runs(task_id, limit, &state.run_repository(), cli.json).await
        }
        Commands::Show { run_id } => {
            cli::history::handle_show(&run_id, &state.run_repository(), cli.json).await
        }
        Commands::Logs { run_id } => {
            cli::history::handle_logs(&run_id, &state.run_repository(), cli.json).await
        }
        Commands::Completions { .. } | Commands::Validate { .. } => Ok(()),
    }
}
