//! Archive catalog and fetch planning.
//!
//! Enumerates the hourly archive files a time range implies, compares them
//! against the processing ledger, and decides which ones actually need a
//! download. Planning is deterministic for a fixed "now"; the most recent
//! hours inside the safety margin are deferred, not treated as missing,
//! because upstream may still be finalizing them.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::ArchiveConfig;
use crate::downloader::ArchiveSource;
use crate::models::{ArchiveHour, ProcessedFile};

/// Why a planned hour does or does not need fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    /// No ledger row exists for this hour.
    NeverProcessed,
    /// A ledger row exists but the last run did not finish the file.
    Incomplete,
    /// The upstream cache key no longer matches the stored one.
    Changed,
    /// Fully processed and unchanged upstream.
    UpToDate,
    /// Covered by a resolved missing range; upstream never published it.
    KnownGap,
}

/// One planned hour with its fetch verdict.
#[derive(Debug, Clone)]
pub struct FetchDecision {
    pub hour: ArchiveHour,
    pub needed: bool,
    pub reason: PlanReason,
    /// Cache key to send as a conditional request header. Only set for
    /// fully processed files, where a 304 legitimately means "skip".
    pub cached_key: Option<String>,
}

/// Enumerate the archive hours of `[start, end]` inclusive, dropping hours
/// newer than `now - safety_margin_hours`. Deterministic for a fixed `now`.
pub fn plan_range(
    start: ArchiveHour,
    end: ArchiveHour,
    now: DateTime<Utc>,
    safety_margin_hours: i64,
) -> Vec<ArchiveHour> {
    let cutoff = now - Duration::hours(safety_margin_hours);
    let mut hours = Vec::new();
    let mut current = start;
    while current <= end {
        if current.timestamp() + Duration::hours(1) <= cutoff {
            hours.push(current);
        }
        current = current.next();
    }
    hours
}

/// Pure fetch verdict from the ledger row and (optionally) the upstream
/// cache key learned from a probe.
pub fn needs_fetch(stored: Option<&ProcessedFile>, remote_key: Option<&str>) -> PlanReason {
    match stored {
        None => PlanReason::NeverProcessed,
        Some(file) if !file.is_complete => PlanReason::Incomplete,
        Some(file) => match (file.cache_key.as_deref(), remote_key) {
            (Some(ours), Some(theirs)) if ours != theirs => PlanReason::Changed,
            // Either side missing a key leaves no evidence of change.
            _ => PlanReason::UpToDate,
        },
    }
}

/// Load the ledger row for one archive file, if any.
pub async fn load_processed(pool: &SqlitePool, file_name: &str) -> Result<Option<ProcessedFile>> {
    let row = sqlx::query(
        r#"
        SELECT file_path, file_size, cache_key, event_count, is_complete, processed_at
        FROM processed_files WHERE file_path = ?
        "#,
    )
    .bind(file_name)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| ProcessedFile {
        file_path: r.get("file_path"),
        file_size: r.get("file_size"),
        cache_key: r.get("cache_key"),
        event_count: r.get("event_count"),
        is_complete: r.get::<i64, _>("is_complete") != 0,
        processed_at: r.get("processed_at"),
    }))
}

/// Decide, for each planned hour, whether a fetch is needed.
///
/// Fully processed files inside the recheck window are re-probed for a
/// changed upstream cache key; older complete files are trusted without
/// network traffic. A failed probe falls back to the stored verdict so a
/// flaky HEAD cannot force a re-download.
pub async fn plan_fetches(
    pool: &SqlitePool,
    source: &dyn ArchiveSource,
    config: &ArchiveConfig,
    hours: &[ArchiveHour],
    now: DateTime<Utc>,
) -> Result<Vec<FetchDecision>> {
    let recheck_cutoff = now - Duration::hours(config.recheck_hours);
    let resolved = resolved_ranges(pool).await?;
    let mut decisions = Vec::with_capacity(hours.len());

    for hour in hours {
        let stored = load_processed(pool, &hour.file_name()).await?;

        // Hours inside a resolved range with no ledger row are permanent
        // gaps; re-fetching them would 404 forever.
        let epoch = hour.timestamp().timestamp();
        if stored.is_none() && resolved.iter().any(|r| r.contains(epoch)) {
            decisions.push(FetchDecision {
                hour: *hour,
                needed: false,
                reason: PlanReason::KnownGap,
                cached_key: None,
            });
            continue;
        }

        let remote_key = match &stored {
            Some(file) if file.is_complete && hour.timestamp() >= recheck_cutoff => {
                match source.probe(hour).await {
                    Ok(probe) if probe.exists => probe.cache_key,
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(file = %hour.file_name(), "probe failed, trusting ledger: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        let reason = needs_fetch(stored.as_ref(), remote_key.as_deref());
        let cached_key = match reason {
            // Conditional fetch is only safe when our copy was fully
            // ingested; a 304 on an incomplete file would skip re-ingest.
            PlanReason::Changed | PlanReason::UpToDate => {
                stored.as_ref().and_then(|f| f.cache_key.clone())
            }
            _ => None,
        };

        decisions.push(FetchDecision {
            hour: *hour,
            needed: reason != PlanReason::UpToDate,
            reason,
            cached_key,
        });
    }
    Ok(decisions)
}

async fn resolved_ranges(pool: &SqlitePool) -> Result<Vec<crate::models::MissingRange>> {
    let rows = sqlx::query(
        "SELECT start_hour, end_hour, detected_at, resolved_at FROM missing_ranges \
         WHERE resolved_at IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| crate::models::MissingRange {
            start_hour: r.get("start_hour"),
            end_hour: r.get("end_hour"),
            detected_at: r.get("detected_at"),
            resolved_at: r.get("resolved_at"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{FetchError, FetchOutcome, ProbeResult};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::path::Path;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(s: &str, hour: u32) -> DateTime<Utc> {
        date(s).and_hms_opt(hour, 30, 0).unwrap().and_utc()
    }

    #[test]
    fn plan_range_is_inclusive_and_ordered() {
        let start = ArchiveHour::new(date("2024-01-15"), 22);
        let end = ArchiveHour::new(date("2024-01-16"), 2);
        let hours = plan_range(start, end, at("2024-02-01", 0), 2);
        assert_eq!(hours.len(), 5);
        assert_eq!(hours[0], start);
        assert_eq!(hours[4], end);
        assert!(hours.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn plan_range_defers_recent_hours() {
        let start = ArchiveHour::new(date("2024-01-15"), 0);
        let end = ArchiveHour::new(date("2024-01-15"), 23);
        // Now is 10:30 on the same day with a 2h margin (cutoff 08:30):
        // the 07:00 hour, ending at 08:00, is the last one included.
        let hours = plan_range(start, end, at("2024-01-15", 10), 2);
        assert_eq!(hours.len(), 8);
        assert_eq!(hours.last().unwrap().hour, 7);
    }

    #[test]
    fn plan_range_can_be_empty() {
        let start = ArchiveHour::new(date("2024-01-15"), 9);
        let end = ArchiveHour::new(date("2024-01-15"), 23);
        assert!(plan_range(start, end, at("2024-01-15", 10), 2).is_empty());
        // Inverted bounds produce nothing rather than panicking.
        assert!(plan_range(end, start, at("2024-02-01", 0), 0).is_empty());
    }

    fn ledger_row(complete: bool, key: Option<&str>) -> ProcessedFile {
        ProcessedFile {
            file_path: "2024-01-15-3.json.gz".into(),
            file_size: 100,
            cache_key: key.map(str::to_string),
            event_count: 10,
            is_complete: complete,
            processed_at: 0,
        }
    }

    #[test]
    fn fetch_verdicts() {
        assert_eq!(needs_fetch(None, None), PlanReason::NeverProcessed);
        assert_eq!(
            needs_fetch(Some(&ledger_row(false, Some("\"a\""))), None),
            PlanReason::Incomplete
        );
        assert_eq!(
            needs_fetch(Some(&ledger_row(true, Some("\"a\""))), Some("\"b\"")),
            PlanReason::Changed
        );
        assert_eq!(
            needs_fetch(Some(&ledger_row(true, Some("\"a\""))), Some("\"a\"")),
            PlanReason::UpToDate
        );
        // No key on either side is not evidence of change.
        assert_eq!(
            needs_fetch(Some(&ledger_row(true, None)), None),
            PlanReason::UpToDate
        );
        assert_eq!(
            needs_fetch(Some(&ledger_row(true, Some("\"a\""))), None),
            PlanReason::UpToDate
        );
    }

    struct StaticSource {
        key: Option<String>,
        probes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ArchiveSource for StaticSource {
        async fn probe(&self, _hour: &ArchiveHour) -> Result<ProbeResult, FetchError> {
            self.probes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ProbeResult {
                exists: true,
                cache_key: self.key.clone(),
                size: Some(1),
            })
        }

        async fn fetch(
            &self,
            _hour: &ArchiveHour,
            _cached_key: Option<&str>,
            _dest: &Path,
        ) -> Result<FetchOutcome, FetchError> {
            unreachable!("planning never downloads")
        }
    }

    async fn pool() -> SqlitePool {
        // One connection: a fresh in-memory database per extra connection
        // would make the pool see different schemas.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn record(pool: &SqlitePool, file: &ProcessedFile) {
        sqlx::query(
            r#"
            INSERT INTO processed_files
                (file_path, file_size, cache_key, event_count, is_complete, processed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.file_path)
        .bind(file.file_size)
        .bind(&file.cache_key)
        .bind(file.event_count)
        .bind(file.is_complete as i64)
        .bind(file.processed_at)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn complete_recent_file_is_probed_and_skipped_when_unchanged() {
        let pool = pool().await;
        let hour = ArchiveHour::new(date("2024-01-15"), 3);
        let mut row = ledger_row(true, Some("\"a\""));
        row.file_path = hour.file_name();
        record(&pool, &row).await;

        let source = StaticSource {
            key: Some("\"a\"".into()),
            probes: Default::default(),
        };
        let config = ArchiveConfig::default();
        let now = at("2024-01-15", 12);
        let decisions = plan_fetches(&pool, &source, &config, &[hour], now)
            .await
            .unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(!decisions[0].needed);
        assert_eq!(decisions[0].reason, PlanReason::UpToDate);
        assert_eq!(source.probes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_key_triggers_conditional_refetch() {
        let pool = pool().await;
        let hour = ArchiveHour::new(date("2024-01-15"), 3);
        let mut row = ledger_row(true, Some("\"a\""));
        row.file_path = hour.file_name();
        record(&pool, &row).await;

        let source = StaticSource {
            key: Some("\"b\"".into()),
            probes: Default::default(),
        };
        let decisions = plan_fetches(
            &pool,
            &source,
            &ArchiveConfig::default(),
            &[hour],
            at("2024-01-15", 12),
        )
        .await
        .unwrap();
        assert!(decisions[0].needed);
        assert_eq!(decisions[0].reason, PlanReason::Changed);
        assert_eq!(decisions[0].cached_key.as_deref(), Some("\"a\""));
    }

    #[tokio::test]
    async fn old_complete_file_is_trusted_without_probing() {
        let pool = pool().await;
        let hour = ArchiveHour::new(date("2024-01-15"), 3);
        let mut row = ledger_row(true, Some("\"a\""));
        row.file_path = hour.file_name();
        record(&pool, &row).await;

        let source = StaticSource {
            key: Some("\"b\"".into()),
            probes: Default::default(),
        };
        // Well past the recheck window.
        let decisions = plan_fetches(
            &pool,
            &source,
            &ArchiveConfig::default(),
            &[hour],
            at("2024-03-01", 0),
        )
        .await
        .unwrap();
        assert!(!decisions[0].needed);
        assert_eq!(source.probes.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unprocessed_and_incomplete_need_unconditional_fetch() {
        let pool = pool().await;
        let fresh = ArchiveHour::new(date("2024-01-15"), 3);
        let partial = ArchiveHour::new(date("2024-01-15"), 4);
        let mut row = ledger_row(false, Some("\"a\""));
        row.file_path = partial.file_name();
        record(&pool, &row).await;

        let source = StaticSource {
            key: None,
            probes: Default::default(),
        };
        let decisions = plan_fetches(
            &pool,
            &source,
            &ArchiveConfig::default(),
            &[fresh, partial],
            at("2024-01-16", 12),
        )
        .await
        .unwrap();
        assert!(decisions[0].needed);
        assert_eq!(decisions[0].reason, PlanReason::NeverProcessed);
        assert!(decisions[0].cached_key.is_none());
        assert!(decisions[1].needed);
        assert_eq!(decisions[1].reason, PlanReason::Incomplete);
        // An incomplete file must never fetch conditionally.
        assert!(decisions[1].cached_key.is_none());
    }
}
