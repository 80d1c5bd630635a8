//! runlane gateway operator tool
//!
//! Inspects the resolved configuration and the persisted sub-agent run
//! registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use runlane_core::config::{database_path, load_config};
use runlane_gateway::slots::SpawnSlots;
use runlane_gateway::storage::{Database, RunStore};
use runlane_gateway::subagent::RunRegistry;

#[derive(Parser, Debug)]
#[command(name = "runlane-gateway")]
#[command(version, about = "runlane gateway - run scheduling core operator tool")]
struct Args {
    /// Project directory whose `.runlane/settings.json` is layered over the
    /// global config
    #[arg(long, env = "RUNLANE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long, env = "RUNLANE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn"). Overrides the config.
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, env = "RUNLANE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved configuration as JSON
    Config,
    /// List persisted sub-agent runs of a requester session
    Runs {
        #[arg(long)]
        requester: String,
    },
    /// End runs older than the given age and print how many were ended
    Sweep {
        /// Defaults to `subagents.archive_after_minutes`
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[tokio::main]
#[allow(clippy::print_stdout)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(args.config_dir.as_deref()).context("Failed to load configuration")?;
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(config.gateway.log_level.as_str());
    runlane_core::tracing_init::init_tracing(log_level, args.log_json)
        .context("Failed to initialise logging")?;

    if matches!(args.command, Command::Config) {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let path = match args.db_path.or_else(|| config.gateway.database_path.clone()) {
        Some(path) => path,
        None => database_path().context("Could not determine data directory")?,
    };
    info!(path = %path.display(), "Opening database");
    let db = Database::open(&path).await?;

    match args.command {
        Command::Config => {}
        Command::Runs { requester } => {
            let rows = db.list_by_requester(&requester).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Sweep { max_age_secs } => {
            let max_age = max_age_secs.map_or_else(
                || Duration::from_secs(config.subagents.archive_after_minutes.saturating_mul(60)),
                Duration::from_secs,
            );
            let registry = RunRegistry::new(SpawnSlots::new(), Arc::new(db));
            let restored = registry.restore_from_store().await?;
            let swept = registry.sweep(max_age).await;
            info!(restored, swept, "Sweep complete");
            println!("{swept}");
        }
    }

    Ok(())
}
