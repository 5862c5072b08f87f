//! Command surface for the `rtoggle` binary.
//!
//! Hosts can embed the tool through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_apply`] for a run against an already opened [`SqliteRecordStore`].
//! - [`load_rules`] to decode a JSON rule file.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use record_toggle_core::{
    apply_rules, plan_rules, RulePlan, RunConfig, RunMode, RunSummary, ToggleConfig,
    TracingLogSink,
};
use record_toggle_store_sqlite::SqliteRecordStore;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rtoggle")]
#[command(about = "Bulk toggle of record active flags")]
pub struct Cli {
    #[arg(long, default_value = "./records.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Query every rule and set `active` on matching records.
    Apply(ApplyArgs),
    /// Print the resolved query for every rule without touching the store.
    Plan(PlanArgs),
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    #[arg(long)]
    rules: PathBuf,
    #[arg(long)]
    target: TargetArg,
    /// Persist changes. Without this flag the run only logs what would change.
    #[arg(long)]
    live: bool,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[arg(long)]
    rules: PathBuf,
    #[arg(long)]
    target: TargetArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TargetArg {
    Active,
    Inactive,
}

impl TargetArg {
    fn as_state(self) -> bool {
        matches!(self, Self::Active)
    }
}

#[derive(Debug, Serialize)]
struct PlanReport {
    source: String,
    target_state: bool,
    rules: Vec<RulePlan>,
}

/// Installs the stderr tracing subscriber. Filtering follows `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the rule file cannot be loaded, the store cannot be
/// opened, or output serialization fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Apply(args) => {
            let config = load_rules(&args.rules)?;
            let mode = if args.live {
                RunMode::Live
            } else {
                RunMode::Debug
            };
            let mut store = SqliteRecordStore::open(&cli.db)?;
            let summary = run_apply(&config, args.target.as_state(), mode, &mut store);
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Plan(args) => {
            let config = load_rules(&args.rules)?;
            let target_state = args.target.as_state();
            let report = PlanReport {
                rules: plan_rules(&config.rules, target_state),
                source: config.source,
                target_state,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Runs every rule of `config` against `store`, logging through tracing.
pub fn run_apply(
    config: &ToggleConfig,
    target_state: bool,
    mode: RunMode,
    store: &mut SqliteRecordStore,
) -> RunSummary {
    let run_config = RunConfig::new(target_state, mode).with_source(config.source.clone());
    tracing::info!(
        rules = config.rules.len(),
        target = target_state,
        mode = mode.as_str(),
        "starting toggle run"
    );

    let summary = apply_rules(&config.rules, &run_config, store, &mut TracingLogSink);

    tracing::info!(
        matched = summary.records_matched,
        updated = summary.records_updated,
        failed = summary.records_failed,
        "toggle run finished"
    );
    summary
}

/// Reads and validates a JSON rule file.
///
/// # Errors
/// Returns an error when the file cannot be read or does not decode into a
/// valid [`ToggleConfig`].
pub fn load_rules(path: &Path) -> Result<ToggleConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file {}", path.display()))?;
    ToggleConfig::from_json_str(&raw).map_err(|err| anyhow!("{}: {err}", path.display()))
}
