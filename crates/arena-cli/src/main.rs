//! Agent Race Arena CLI
//!
//! The `arena` command runs races and inspects their records.
//!
//! ## Commands
//!
//! - `run`: provision instances, run every agent, print the leaderboard
//! - `history`: list stored races
//! - `show`: print a stored race's leaderboard
//! - `verify`: re-check a stored record's digest

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{warn, Level};

use arena_core::telemetry::{init_tracing, LogFormat};
use arena_core::{RaceConfig, RaceDeps, RaceHistory, RaceOrchestrator, RaceRecord, RaceStatus};
use arena_store::FsRaceRecordStore;

#[derive(Parser)]
#[command(name = "arena")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Race AI agents against identical simulations", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding finalized race records
    #[arg(long, global = true, env = "ARENA_RECORDS_DIR", default_value = ".arena/records")]
    records_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a race described by a TOML config
    Run {
        /// Race config file
        #[arg(short, long)]
        config: PathBuf,

        /// Print live standings every N seconds
        #[arg(long)]
        status_every: Option<u64>,

        /// Do not persist the race record
        #[arg(long)]
        no_save: bool,
    },

    /// List stored races, oldest first
    History {
        /// Only races of this scenario
        #[arg(long)]
        scenario: Option<String>,
    },

    /// Print a stored race's leaderboard
    Show { race_id: String },

    /// Re-check a stored record against its digest
    Verify { race_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_tracing(format, level);

    match cli.command {
        Commands::Run {
            config,
            status_every,
            no_save,
        } => {
            let history = if no_save {
                None
            } else {
                Some(open_history(&cli.records_dir)?)
            };
            cmd_run(&config, history, status_every, cli.json).await
        }
        Commands::History { scenario } => {
            cmd_history(&open_history(&cli.records_dir)?, scenario.as_deref(), cli.json).await
        }
        Commands::Show { race_id } => {
            cmd_show(&open_history(&cli.records_dir)?, &race_id, cli.json).await
        }
        Commands::Verify { race_id } => cmd_verify(&open_history(&cli.records_dir)?, &race_id).await,
    }
}

fn open_history(dir: &Path) -> Result<RaceHistory> {
    let store = FsRaceRecordStore::open(dir)
        .with_context(|| format!("Failed to open record store at {}", dir.display()))?;
    Ok(RaceHistory::new(Arc::new(store)))
}

/// Run a race to completion
async fn cmd_run(
    config_path: &Path,
    history: Option<RaceHistory>,
    status_every: Option<u64>,
    json: bool,
) -> Result<()> {
    let config = RaceConfig::load(config_path)
        .with_context(|| format!("Failed to load race config {}", config_path.display()))?;

    let mut deps = RaceDeps::local(&config).context("Failed to build simulation clients")?;
    if let Some(history) = history {
        deps = deps.with_history(history);
    }

    let handle = RaceOrchestrator::new(config, deps)?
        .start()
        .await
        .context("Failed to start race")?;
    eprintln!("Race {} started", handle.race_id());

    let monitor = handle.monitor();
    let interrupt = {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling race");
                monitor.cancel();
            }
        })
    };
    let printer = status_every.filter(|secs| *secs > 0).map(|secs| {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                eprint!("{}", render_status(&monitor.status()));
            }
        })
    });

    let record = handle.wait().await.context("Race did not complete")?;
    interrupt.abort();
    if let Some(printer) = printer {
        printer.abort();
    }

    print_record(&record, json)
}

/// List stored races
async fn cmd_history(history: &RaceHistory, scenario: Option<&str>, json: bool) -> Result<()> {
    let races = history.list(scenario).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&races)?);
        return Ok(());
    }
    if races.is_empty() {
        println!("No races recorded.");
        return Ok(());
    }
    for meta in races {
        println!(
            "{}  {}  seed={}  {}  [{}]",
            meta.race_id,
            meta.scenario_id,
            meta.seed,
            meta.finalized_at.format("%Y-%m-%d %H:%M:%S UTC"),
            meta.agents.join(", ")
        );
    }
    Ok(())
}

/// Print a stored race
async fn cmd_show(history: &RaceHistory, race_id: &str, json: bool) -> Result<()> {
    let record = history
        .load(race_id)
        .await
        .with_context(|| format!("Failed to load race '{}'", race_id))?;
    print_record(&record, json)
}

/// Verify a stored record's digest
async fn cmd_verify(history: &RaceHistory, race_id: &str) -> Result<()> {
    let digest = history
        .verify(race_id)
        .await
        .with_context(|| format!("Record for race '{}' failed verification", race_id))?;
    println!("ok {} {}", race_id, digest);
    Ok(())
}

fn print_record(record: &RaceRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
    } else {
        print!("{}", render_leaderboard(record));
    }
    Ok(())
}

fn number(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}

fn render_leaderboard(record: &RaceRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Race {}  scenario={}  seed={}  duration={}{}",
        record.meta.race_id,
        record.meta.scenario_id,
        record.meta.seed,
        record.meta.duration,
        if record.cancelled { "  (cancelled)" } else { "" }
    );
    let _ = writeln!(
        out,
        "{:<5} {:<16} {:<10} {:<10} {:>12} {:>12} {:>8} {:>6}  REASON",
        "RANK", "AGENT", "STATUS", "SCHEME", "SCORE", "METRIC", "PROGRESS", "STEPS"
    );
    for entry in &record.entries {
        let _ = writeln!(
            out,
            "{:<5} {:<16} {:<10} {:<10} {:>12} {:>12} {:>8} {:>6}  {}",
            entry.rank,
            entry.agent,
            entry.status,
            entry.scheme,
            number(entry.value),
            number(entry.final_metric),
            entry.progress,
            entry.steps,
            entry.reason.as_deref().unwrap_or("")
        );
    }
    out
}

fn render_status(status: &RaceStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "[{}] {}{}",
        status.scenario_id,
        if status.complete { "complete" } else { "running" },
        if status.cancelled { " (cancelling)" } else { "" }
    );
    for run in &status.agents {
        let _ = writeln!(
            out,
            "  {:<16} {:<10} progress={:<5} metric={:<12} steps={}",
            run.name,
            run.status,
            run.progress,
            number(run.latest_metric()),
            run.steps
        );
    }
    out
}
