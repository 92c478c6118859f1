//! Pipeline orchestration.
//!
//! Owns the run modes, the bounded worker pool, and the pause/resume
//! behavior under resource pressure. Each archive file moves through
//! fetch, streaming parse, and batch ingest inside one worker task; the
//! orchestrator only decides how many such tasks may run at once.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use sqlx::{Row, SqlitePool};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::catalog::{self, FetchDecision, PlanReason};
use crate::config::Config;
use crate::downloader::{
    fetch_with_retry, spool_path, ArchiveSource, FetchError, FetchOutcome, RetryPolicy,
};
use crate::ingest::BatchIngestor;
use crate::models::{ArchiveHour, ParseStats, Pressure, ResourceSnapshot, ValidatedEvent};
use crate::monitor::classify;
use crate::reconcile;
use crate::status::{PipelineState, PipelineStatus};
use crate::stream::GzEventStream;

/// What a run should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Resume from the newest fully processed hour and keep following the
    /// archive as new hours become available.
    Catchup,
    /// All 24 hours of one UTC date.
    SingleDate(NaiveDate),
    /// Every hour of an inclusive date range.
    Range { start: NaiveDate, end: NaiveDate },
    /// Plan and probe without downloading or writing anything.
    Discover,
    /// Re-attempt only the hours covered by open missing ranges.
    Missing,
}

/// Aggregate counts for one run, printed by the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub files_complete: u64,
    pub files_incomplete: u64,
    pub files_unchanged: u64,
    pub files_failed: u64,
    pub permanent_gaps: u64,
    pub events_ingested: u64,
    pub duplicate_events: u64,
    pub rejected_records: u64,
}

/// Terminal state of one archive file within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Complete,
    Incomplete,
    Unchanged,
    Gone,
    Cancelled,
}

/// Everything a worker task needs, cheap to clone per file.
#[derive(Clone)]
struct TaskCtx {
    config: Arc<Config>,
    pool: SqlitePool,
    source: Arc<dyn ArchiveSource>,
    ingestor: Arc<BatchIngestor>,
    status: Arc<PipelineStatus>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

pub struct Orchestrator {
    config: Arc<Config>,
    pool: SqlitePool,
    source: Arc<dyn ArchiveSource>,
    ingestor: Arc<BatchIngestor>,
    status: Arc<PipelineStatus>,
    pressure_rx: watch::Receiver<ResourceSnapshot>,
    shutdown: CancellationToken,
    retry: RetryPolicy,
}

/// Concurrency allowed at a given pressure level. Critical stops new
/// work entirely; Warning halves it but keeps the pipeline moving.
fn effective_limit(pressure: Pressure, configured: usize) -> usize {
    match pressure {
        Pressure::Normal => configured,
        Pressure::Warning => (configured / 2).max(1),
        Pressure::Critical => 0,
    }
}

/// First and last archive hour of an inclusive date range.
fn date_bounds(start: NaiveDate, end: NaiveDate) -> (ArchiveHour, ArchiveHour) {
    (ArchiveHour::new(start, 0), ArchiveHour::new(end, 23))
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        source: Arc<dyn ArchiveSource>,
        pressure_rx: watch::Receiver<ResourceSnapshot>,
        status: Arc<PipelineStatus>,
        shutdown: CancellationToken,
    ) -> Self {
        let ingestor = Arc::new(BatchIngestor::new(pool.clone(), &config.ingest));
        let retry = RetryPolicy::from_config(&config.downloader);
        Self {
            config,
            pool,
            source,
            ingestor,
            status,
            pressure_rx,
            shutdown,
            retry,
        }
    }

    pub async fn run(&mut self, mode: Mode) -> Result<RunSummary> {
        std::fs::create_dir_all(&self.config.archive.work_dir)?;
        match mode {
            Mode::Catchup => self.run_catchup().await?,
            Mode::SingleDate(date) => {
                let (start, end) = date_bounds(date, date);
                self.run_bounded(start, end).await?;
            }
            Mode::Range { start, end } => {
                let (start, end) = date_bounds(start, end);
                self.run_bounded(start, end).await?;
            }
            Mode::Discover => self.run_discover().await?,
            Mode::Missing => self.run_missing().await?,
        }
        self.status.set_state(PipelineState::Idle);
        Ok(self.summary())
    }

    /// Point-in-time pipeline status, for external pollers.
    pub fn status(&self) -> crate::status::StatusSnapshot {
        self.status.snapshot()
    }

    pub fn summary(&self) -> RunSummary {
        let snap = self.status.snapshot();
        RunSummary {
            files_complete: snap.files_complete,
            files_incomplete: snap.files_incomplete,
            files_unchanged: snap.files_unchanged,
            files_failed: snap.files_failed,
            permanent_gaps: snap.permanent_gaps,
            events_ingested: snap.events_ingested,
            duplicate_events: snap.duplicate_events,
            rejected_records: snap.rejected_records,
        }
    }

    async fn run_bounded(&mut self, start: ArchiveHour, end: ArchiveHour) -> Result<()> {
        let now = Utc::now();
        let hours = catalog::plan_range(start, end, now, self.config.archive.safety_margin_hours);
        self.run_pass(&hours).await?;
        self.reconcile_span(&hours, now).await
    }

    /// Follow the archive: process everything from the resume point to the
    /// eligible edge, then wake on each hour boundary for the next file.
    async fn run_catchup(&mut self) -> Result<()> {
        loop {
            let now = Utc::now();
            let start = self.catchup_start(now).await?;
            let end = ArchiveHour::containing(now);
            // Recorded gaps and files a previous run left incomplete ride
            // along with each pass; they sit behind the resume point and
            // would otherwise wait for an operator to run missing mode.
            let mut hours = self.backlog_hours(start).await?;
            hours.extend(catalog::plan_range(
                start,
                end,
                now,
                self.config.archive.safety_margin_hours,
            ));
            if !hours.is_empty() {
                self.run_pass(&hours).await?;
                self.reconcile_span(&hours, Utc::now()).await?;
            }
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            // One more hour becomes eligible at each wall-clock boundary.
            // Jitter spreads load across instances sharing the mirror.
            let boundary = ArchiveHour::containing(Utc::now()).next().timestamp();
            let jitter: u64 = rand::thread_rng().gen_range(5..=60);
            let wait = (boundary - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1))
                + Duration::from_secs(jitter);
            tracing::info!(wait_secs = wait.as_secs(), "caught up, waiting for next hour");
            self.status.set_state(PipelineState::Idle);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Resume point: the hour after the newest fully processed file, or a
    /// bounded backfill window when the ledger is empty.
    async fn catchup_start(&self, now: DateTime<Utc>) -> Result<ArchiveHour> {
        let rows = sqlx::query("SELECT file_path FROM processed_files WHERE is_complete = 1")
            .fetch_all(&self.pool)
            .await?;
        let newest = rows
            .iter()
            .filter_map(|r| ArchiveHour::parse(r.get("file_path")))
            .max();
        Ok(match newest {
            Some(hour) => hour.next(),
            None => ArchiveHour::containing(
                now - chrono::Duration::hours(self.config.archive.default_backfill_hours),
            ),
        })
    }

    /// Hours behind the resume point that still need work: open missing
    /// ranges plus files a previous run left incomplete. Sorted, so
    /// prepending them to a forward plan keeps the pass hours ordered.
    async fn backlog_hours(&self, before: ArchiveHour) -> Result<Vec<ArchiveHour>> {
        let mut hours = reconcile::unresolved_hours(&self.pool).await?;
        let rows = sqlx::query("SELECT file_path FROM processed_files WHERE is_complete = 0")
            .fetch_all(&self.pool)
            .await?;
        hours.extend(
            rows.iter()
                .filter_map(|r| ArchiveHour::parse(r.get("file_path"))),
        );
        hours.retain(|h| *h < before);
        hours.sort_unstable();
        hours.dedup();
        Ok(hours)
    }

    async fn run_missing(&mut self) -> Result<()> {
        let hours = reconcile::unresolved_hours(&self.pool).await?;
        if hours.is_empty() {
            tracing::info!("no open missing ranges");
            return Ok(());
        }
        tracing::info!(hours = hours.len(), "re-attempting missing hours");
        self.run_pass(&hours).await?;
        self.status.set_state(PipelineState::Reconciling);
        reconcile::resolve_completed(&self.pool, Utc::now()).await?;
        Ok(())
    }

    /// Report what a catchup run would do, without downloading.
    async fn run_discover(&mut self) -> Result<()> {
        let now = Utc::now();
        let start = self.catchup_start(now).await?;
        let end = ArchiveHour::containing(now);
        let mut hours = self.backlog_hours(start).await?;
        hours.extend(catalog::plan_range(
            start,
            end,
            now,
            self.config.archive.safety_margin_hours,
        ));
        self.status.set_state(PipelineState::Planning);
        let decisions = catalog::plan_fetches(
            &self.pool,
            self.source.as_ref(),
            &self.config.archive,
            &hours,
            now,
        )
        .await?;

        println!("Archive discovery: {} eligible hour(s)", decisions.len());
        let mut to_fetch = 0usize;
        let mut absent = 0usize;
        for decision in &decisions {
            if !decision.needed {
                continue;
            }
            let verdict = match decision.reason {
                PlanReason::NeverProcessed => {
                    // Probe so operators see permanent gaps before a run.
                    match self.source.probe(&decision.hour).await {
                        Ok(probe) if !probe.exists => {
                            absent += 1;
                            "absent upstream"
                        }
                        _ => "fetch (never processed)",
                    }
                }
                PlanReason::Incomplete => "re-fetch (incomplete)",
                PlanReason::Changed => "re-fetch (changed upstream)",
                PlanReason::UpToDate | PlanReason::KnownGap => continue,
            };
            to_fetch += 1;
            println!("  {}  {}", decision.hour.file_name(), verdict);
        }
        println!(
            "{} file(s) would be fetched, {} up to date, {} absent upstream",
            to_fetch.saturating_sub(absent),
            decisions.iter().filter(|d| !d.needed).count(),
            absent
        );
        Ok(())
    }

    /// Process one planned set of hours through the bounded worker pool.
    async fn run_pass(&mut self, hours: &[ArchiveHour]) -> Result<()> {
        if hours.is_empty() {
            return Ok(());
        }
        self.status.set_state(PipelineState::Planning);
        let decisions = catalog::plan_fetches(
            &self.pool,
            self.source.as_ref(),
            &self.config.archive,
            hours,
            Utc::now(),
        )
        .await?;

        let mut queue: VecDeque<FetchDecision> = VecDeque::new();
        for decision in decisions {
            if decision.needed {
                queue.push_back(decision);
            } else {
                self.status.add_unchanged();
            }
        }
        self.status.set_queued(queue.len());
        tracing::info!(files = queue.len(), "pass planned");

        let ctx = TaskCtx {
            config: Arc::clone(&self.config),
            pool: self.pool.clone(),
            source: Arc::clone(&self.source),
            ingestor: Arc::clone(&self.ingestor),
            status: Arc::clone(&self.status),
            retry: self.retry.clone(),
            shutdown: self.shutdown.clone(),
        };

        let mut set: JoinSet<()> = JoinSet::new();
        let mut pressure_rx = self.pressure_rx.clone();
        let mut shutting_down = false;

        loop {
            let pressure = classify(&pressure_rx.borrow(), &self.config.resources);
            let limit = if shutting_down {
                0
            } else {
                effective_limit(pressure, self.config.downloader.max_concurrent)
            };

            while set.len() < limit {
                let Some(decision) = queue.pop_front() else {
                    break;
                };
                self.status.file_started();
                let ctx = ctx.clone();
                set.spawn(async move { process_decision(ctx, decision).await });
            }

            if set.is_empty() && (queue.is_empty() || shutting_down) {
                break;
            }

            self.status.set_state(if limit == 0 && !shutting_down {
                PipelineState::Paused
            } else {
                PipelineState::Fetching
            });

            tokio::select! {
                joined = set.join_next(), if !set.is_empty() => {
                    self.status.file_finished();
                    if let Some(Err(e)) = joined {
                        tracing::error!("worker task panicked: {e}");
                        self.status.add_failed();
                    }
                }
                changed = pressure_rx.changed() => {
                    if changed.is_err() {
                        // Monitor gone; re-poll on a fixed cadence instead
                        // of spinning on a closed channel.
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
                _ = self.shutdown.cancelled(), if !shutting_down => {
                    shutting_down = true;
                    tracing::info!(
                        dropped = queue.len(),
                        in_flight = set.len(),
                        "shutdown requested, draining in-flight files"
                    );
                    queue.clear();
                    self.status.set_queued(0);
                }
            }
        }
        Ok(())
    }

    /// Record the gaps a pass left behind and close ranges that filled in.
    async fn reconcile_span(&mut self, hours: &[ArchiveHour], now: DateTime<Utc>) -> Result<()> {
        let (Some(first), Some(last)) = (hours.first(), hours.last()) else {
            return Ok(());
        };
        self.status.set_state(PipelineState::Reconciling);
        let gaps = reconcile::scan(&self.pool, *first, *last, now).await?;
        if !gaps.is_empty() {
            let recorded = reconcile::record_gaps(&self.pool, &gaps).await?;
            tracing::warn!(ranges = recorded, "recorded missing ranges");
        }
        let resolved = reconcile::resolve_completed(&self.pool, now).await?;
        if resolved > 0 {
            tracing::info!(ranges = resolved, "resolved missing ranges");
        }
        Ok(())
    }
}

async fn process_decision(ctx: TaskCtx, decision: FetchDecision) {
    let file = decision.hour.file_name();
    match process_hour(&ctx, &decision).await {
        Ok(FileOutcome::Complete) => ctx.status.add_complete(),
        Ok(FileOutcome::Incomplete) => ctx.status.add_incomplete(),
        Ok(FileOutcome::Unchanged) => {
            tracing::info!(file = %file, "unchanged upstream, skipped");
            ctx.status.add_unchanged();
        }
        Ok(FileOutcome::Gone) => {
            tracing::warn!(file = %file, "archive hour absent upstream, recorded permanent gap");
            ctx.status.add_permanent_gap();
        }
        Ok(FileOutcome::Cancelled) => {}
        Err(e) => {
            tracing::error!(file = %file, "file failed: {e:#}");
            ctx.status.add_failed();
        }
    }
}

/// Fetch one archive file and, when a body arrives, stream it into the
/// store. The spool file is removed whatever happens.
async fn process_hour(ctx: &TaskCtx, decision: &FetchDecision) -> Result<FileOutcome> {
    let dest = spool_path(&ctx.config.archive.work_dir, &decision.hour);
    let fetched = fetch_with_retry(
        ctx.source.as_ref(),
        &decision.hour,
        decision.cached_key.as_deref(),
        &dest,
        &ctx.retry,
        &ctx.shutdown,
    )
    .await;

    match fetched {
        Ok(FetchOutcome::Fetched { size, cache_key }) => {
            let outcome = ingest_file(ctx, &decision.hour, size, cache_key.as_deref()).await;
            let _ = tokio::fs::remove_file(&dest).await;
            outcome
        }
        Ok(FetchOutcome::NotModified) => Ok(FileOutcome::Unchanged),
        Ok(FetchOutcome::Gone) => {
            reconcile::record_permanent_gap(&ctx.pool, &decision.hour).await?;
            Ok(FileOutcome::Gone)
        }
        Err(FetchError::Cancelled) => Ok(FileOutcome::Cancelled),
        Err(e) => Err(e.into()),
    }
}

/// Parse on a blocking thread, ingest on the async side, with a bounded
/// batch queue between them. A full queue blocks the parser; a storage
/// failure drops the receiver, which stops the parser at its next send.
async fn ingest_file(
    ctx: &TaskCtx,
    hour: &ArchiveHour,
    size: u64,
    cache_key: Option<&str>,
) -> Result<FileOutcome> {
    let file_name = hour.file_name();
    let path = spool_path(&ctx.config.archive.work_dir, hour);
    let batch_size = ctx.ingestor.batch_size();
    let (tx, mut rx) = mpsc::channel::<Vec<ValidatedEvent>>(ctx.config.ingest.queue_depth);

    let parse_hour = *hour;
    let parser = tokio::task::spawn_blocking(move || -> std::io::Result<ParseStats> {
        let mut stream = GzEventStream::open(&path, &parse_hour)?;
        let mut batch = Vec::with_capacity(batch_size);
        while let Some(event) = stream.next_event()? {
            batch.push(event);
            if batch.len() >= batch_size {
                if tx.blocking_send(std::mem::take(&mut batch)).is_err() {
                    // Receiver gone: the ingest side failed, stop parsing.
                    return Ok(stream.stats());
                }
                batch = Vec::with_capacity(batch_size);
            }
        }
        if !batch.is_empty() {
            let _ = tx.blocking_send(batch);
        }
        Ok(stream.stats())
    });

    ctx.status.set_state(PipelineState::Processing);
    let mut accepted: u64 = 0;
    let mut duplicates: u64 = 0;
    let mut storage_err: Option<anyhow::Error> = None;
    while let Some(batch) = rx.recv().await {
        ctx.status.set_state(PipelineState::Ingesting);
        match ctx.ingestor.ingest_batch(&batch, &file_name).await {
            Ok(report) => {
                accepted += report.accepted;
                duplicates += report.duplicates;
            }
            Err(e) => {
                storage_err = Some(e);
                break;
            }
        }
    }
    drop(rx);

    let stats = match parser.await {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(e)) => {
            tracing::warn!(file = %file_name, "parse aborted: {e}");
            None
        }
        Err(e) => {
            tracing::error!(file = %file_name, "parser task failed: {e}");
            None
        }
    };
    let rejected = stats.map(|s| s.rejected).unwrap_or(0);
    ctx.status.add_events(accepted, duplicates, rejected);

    // Duplicates count toward the file's contribution so a replayed file
    // reports the same total it did the first time.
    let event_count = (accepted + duplicates) as i64;
    if let Some(e) = storage_err {
        tracing::error!(file = %file_name, "storage failure, file marked incomplete: {e:#}");
        ctx.status.add_error();
        ctx.ingestor
            .mark_incomplete(&file_name, size as i64, event_count)
            .await?;
        return Ok(FileOutcome::Incomplete);
    }
    match stats {
        Some(stats) => {
            tracing::info!(
                file = %file_name,
                accepted,
                duplicates,
                rejected = stats.rejected,
                "file ingested"
            );
            ctx.ingestor
                .mark_complete(&file_name, size as i64, cache_key, event_count)
                .await?;
            Ok(FileOutcome::Complete)
        }
        None => {
            ctx.status.add_error();
            ctx.ingestor
                .mark_incomplete(&file_name, size as i64, event_count)
                .await?;
            Ok(FileOutcome::Incomplete)
        }
    }
}
