//! # gharvest CLI
//!
//! The `gharvest` binary drives the GitHub Archive ingestion pipeline. It
//! provides commands for database initialization, running the pipeline in
//! its various modes, and inspecting what has been ingested.
//!
//! ## Usage
//!
//! ```bash
//! gharvest --config ./config/gharvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gharvest init` | Create the SQLite database and run schema migrations |
//! | `gharvest run` | Run the pipeline (catchup mode by default) |
//! | `gharvest stats` | Print database statistics |
//!
//! ## Run modes
//!
//! | Mode | Description |
//! |------|-------------|
//! | `catchup` | Resume from the newest ingested hour and follow the archive |
//! | `single-date` | Process all 24 hours of one UTC date (`--date`) |
//! | `range` | Process an inclusive date range (`--start-date`, `--end-date`) |
//! | `discover` | Plan and probe without downloading anything |
//! | `missing` | Re-attempt hours covered by open missing ranges |
//!
//! ## Exit codes
//!
//! `0` on success, `1` on a fatal error (bad config, unreachable
//! database), `2` when the run finished but some files failed or were
//! left incomplete.
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! gharvest init --config ./config/gharvest.toml
//!
//! # Catch up and keep following the archive
//! gharvest run
//!
//! # Backfill one day
//! gharvest run --mode single-date --date 2024-01-15
//!
//! # Backfill a range with reduced concurrency on a small host
//! gharvest run --mode range --start-date 2024-01-01 --end-date 2024-01-07 \
//!     --max-concurrent 2 --memory-limit-gb 2
//!
//! # See what a run would fetch
//! gharvest run --mode discover
//! ```

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gharvest::config;
use gharvest::db;
use gharvest::downloader::HttpArchiveSource;
use gharvest::migrate;
use gharvest::monitor::ResourceMonitor;
use gharvest::orchestrator::{Mode, Orchestrator, RunSummary};
use gharvest::stats;
use gharvest::status::PipelineStatus;

/// gharvest — a resource-aware GitHub Archive ingestion pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gharvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "gharvest",
    about = "gharvest — a resource-aware GitHub Archive ingestion pipeline",
    version,
    long_about = "gharvest downloads the hourly event archives published at \
    data.gharchive.org, validates and normalizes each event, and ingests them \
    into a local SQLite database in idempotent batches, throttling itself when \
    host memory, disk, or CPU run hot."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/gharvest.toml`. Database, archive, downloader,
    /// ingest, and resource settings are read from this file.
    #[arg(long, global = true, default_value = "./config/gharvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (github_events, actors, repositories, processed_files,
    /// missing_ranges, system_metrics). This command is idempotent —
    /// running it multiple times is safe.
    Init,

    /// Run the ingestion pipeline.
    ///
    /// Without flags this runs catchup mode: resume from the newest fully
    /// ingested hour and follow the archive as new hours appear. Other
    /// modes bound the run to a date, a date range, open gaps, or a
    /// download-free discovery pass.
    Run {
        /// Pipeline mode.
        #[arg(long, value_enum, default_value_t = ModeArg::Catchup)]
        mode: ModeArg,

        /// UTC date for single-date mode (YYYY-MM-DD).
        #[arg(long)]
        date: Option<NaiveDate>,

        /// First UTC date for range mode (YYYY-MM-DD, inclusive).
        #[arg(long)]
        start_date: Option<NaiveDate>,

        /// Last UTC date for range mode (YYYY-MM-DD, inclusive).
        #[arg(long)]
        end_date: Option<NaiveDate>,

        /// Override the configured maximum of concurrently processed files.
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Override the configured memory budget in GiB.
        #[arg(long)]
        memory_limit_gb: Option<f64>,
    },

    /// Print database statistics.
    ///
    /// Shows event, actor, and repository counts, the per-type breakdown,
    /// the processing ledger state, and open gaps.
    Stats,
}

/// Pipeline mode names as exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Catchup,
    SingleDate,
    Range,
    Discover,
    Missing,
}

fn resolve_mode(
    mode: ModeArg,
    date: Option<NaiveDate>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<Mode> {
    Ok(match mode {
        ModeArg::Catchup => Mode::Catchup,
        ModeArg::Discover => Mode::Discover,
        ModeArg::Missing => Mode::Missing,
        ModeArg::SingleDate => {
            let date = date.ok_or_else(|| anyhow::anyhow!("--date is required for single-date mode"))?;
            Mode::SingleDate(date)
        }
        ModeArg::Range => {
            let start = start_date
                .ok_or_else(|| anyhow::anyhow!("--start-date is required for range mode"))?;
            let end = end_date
                .ok_or_else(|| anyhow::anyhow!("--end-date is required for range mode"))?;
            if end < start {
                anyhow::bail!("--end-date must not be before --start-date");
            }
            Mode::Range { start, end }
        }
    })
}

fn print_summary(summary: &RunSummary) {
    println!("Run complete.");
    println!(
        "  Files:   {} complete, {} unchanged, {} incomplete, {} failed",
        summary.files_complete,
        summary.files_unchanged,
        summary.files_incomplete,
        summary.files_failed
    );
    println!("  Gaps:    {} permanent", summary.permanent_gaps);
    println!(
        "  Events:  {} ingested, {} duplicates, {} rejected",
        summary.events_ingested, summary.duplicate_events, summary.rejected_records
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Run {
            mode,
            date,
            start_date,
            end_date,
            max_concurrent,
            memory_limit_gb,
        } => {
            if let Some(n) = max_concurrent {
                anyhow::ensure!(n >= 1, "--max-concurrent must be >= 1");
                cfg.downloader.max_concurrent = n;
            }
            if let Some(gb) = memory_limit_gb {
                cfg.resources.memory_limit_gb = gb;
            }
            let mode = resolve_mode(mode, date, start_date, end_date)?;

            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;

            let status = Arc::new(PipelineStatus::new());
            let shutdown = CancellationToken::new();
            {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("interrupt received, finishing in-flight files");
                        shutdown.cancel();
                    }
                });
            }

            let monitor = Arc::new(ResourceMonitor::new(
                cfg.resources.clone(),
                cfg.archive.work_dir.clone(),
            ));
            let pressure_rx = monitor.subscribe();
            let monitor_handle = tokio::spawn(Arc::clone(&monitor).run(
                pool.clone(),
                Arc::clone(&status),
                shutdown.clone(),
            ));

            let source = Arc::new(HttpArchiveSource::new(
                cfg.archive.base_url.clone(),
                &cfg.downloader,
            )?);

            let mut orchestrator = Orchestrator::new(
                Arc::new(cfg),
                pool.clone(),
                source,
                pressure_rx,
                Arc::clone(&status),
                shutdown.clone(),
            );
            let result = orchestrator.run(mode).await;

            shutdown.cancel();
            let _ = monitor_handle.await;
            pool.close().await;

            let summary = result?;
            print_summary(&summary);
            if summary.files_failed > 0 || summary.files_incomplete > 0 {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}
