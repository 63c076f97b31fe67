//! PostgreSQL task runner
//!
//! Dumps, restores and drops configured databases through the PostgreSQL client
//! tools, moves constraints between them, and rebuilds UPDATE/INSERT statements
//! from query snapshots.

// pgsqltool/src/main.rs
mod config;
mod constraints;
mod dispatch;
mod dump;
mod errors;
mod load;
mod overwrite;
mod purge;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use config::AppConfig;
use dispatch::TaskCommand;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "pgsqltool")]
#[command(version, about = "Dump, load, drop and reconcile PostgreSQL databases", long_about = None)]
struct Cli {
    /// JSON config file (defaults to $PGSQLTOOL_CONFIG, then pgsql.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output, including captured process output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Targets to run at once when the target is `all`
    #[arg(short, long, global = true, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    jobs: u16,

    #[command(subcommand)]
    command: TaskCommand,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run_app(cli).await {
        Ok(_) => {
            info!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    // A missing .env file is not an error.
    let _ = dotenv::dotenv();

    let config_path = config::config_path(cli.config);
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    info!(
        "🚀 Starting {} for target {}",
        cli.command.task_name(),
        cli.command.target()
    );
    dispatch::run_task(&app_config, &cli.command, usize::from(cli.jobs))
        .await
        .with_context(|| format!("{} task failed", cli.command.task_name()))
}
