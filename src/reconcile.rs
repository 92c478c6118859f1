//! Gap detection and reconciliation.
//!
//! Compares the hours a time range implies against the processing ledger
//! and records contiguous spans of absent or incomplete hours in
//! `missing_ranges`. Permanently absent hours (a 404 for a past hour) are
//! recorded pre-resolved so they are reported once and never re-planned.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use crate::models::{ArchiveHour, MissingRange};

const HOUR_SECS: i64 = 3600;

/// Collapse a sorted list of hour-boundary epochs into contiguous
/// inclusive ranges. Input order is not assumed.
pub fn ranges_from_hours(missing: &[i64], detected_at: i64) -> Vec<MissingRange> {
    let mut hours: Vec<i64> = missing.to_vec();
    hours.sort_unstable();
    hours.dedup();

    let mut ranges = Vec::new();
    let mut iter = hours.into_iter();
    let Some(first) = iter.next() else {
        return ranges;
    };
    let mut start = first;
    let mut end = first;
    for hour in iter {
        if hour == end + HOUR_SECS {
            end = hour;
        } else {
            ranges.push(MissingRange {
                start_hour: start,
                end_hour: end,
                detected_at,
                resolved_at: None,
            });
            start = hour;
            end = hour;
        }
    }
    ranges.push(MissingRange {
        start_hour: start,
        end_hour: end,
        detected_at,
        resolved_at: None,
    });
    ranges
}

/// Find the hours of `[start, end]` that are neither completely ingested
/// nor already covered by a recorded range (open or resolved). Returns the
/// gaps as contiguous ranges, not yet persisted.
pub async fn scan(
    pool: &SqlitePool,
    start: ArchiveHour,
    end: ArchiveHour,
    now: DateTime<Utc>,
) -> Result<Vec<MissingRange>> {
    let complete = complete_hours(pool).await?;
    let recorded = load_ranges(pool, false).await?;

    let mut missing = Vec::new();
    let mut current = start;
    while current <= end {
        let epoch = current.timestamp().timestamp();
        let covered =
            complete.contains(&epoch) || recorded.iter().any(|r| r.contains(epoch));
        if !covered {
            missing.push(epoch);
        }
        current = current.next();
    }
    Ok(ranges_from_hours(&missing, now.timestamp()))
}

/// Persist detected gaps. Re-detection of an identical range is a no-op.
pub async fn record_gaps(pool: &SqlitePool, ranges: &[MissingRange]) -> Result<usize> {
    let mut inserted = 0;
    for range in ranges {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO missing_ranges
                (start_hour, end_hour, detected_at, resolved_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(range.start_hour)
        .bind(range.end_hour)
        .bind(range.detected_at)
        .bind(range.resolved_at)
        .execute(pool)
        .await?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}

/// Record an hour that upstream will never publish. Stored pre-resolved:
/// the gap is visible in reports but never scheduled again. An earlier
/// transient failure may already have the hour as an open range under the
/// same key, so this must upsert the resolution rather than insert-ignore.
pub async fn record_permanent_gap(pool: &SqlitePool, hour: &ArchiveHour) -> Result<()> {
    let epoch = hour.timestamp().timestamp();
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO missing_ranges
            (start_hour, end_hour, detected_at, resolved_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(start_hour, end_hour) DO UPDATE SET
            resolved_at = excluded.resolved_at
        "#,
    )
    .bind(epoch)
    .bind(epoch)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Resolve open ranges whose every hour is either completely ingested or
/// covered by an already-resolved range (a permanent hole inside a wider
/// gap). Returns how many ranges were closed.
pub async fn resolve_completed(pool: &SqlitePool, now: DateTime<Utc>) -> Result<usize> {
    let complete = complete_hours(pool).await?;
    let (open, closed): (Vec<MissingRange>, Vec<MissingRange>) = load_ranges(pool, false)
        .await?
        .into_iter()
        .partition(|r| r.resolved_at.is_none());

    let mut resolved = 0;
    for range in open {
        let satisfied = range
            .hours()
            .all(|h| complete.contains(&h) || closed.iter().any(|r| r.contains(h)));
        if satisfied {
            sqlx::query(
                r#"
                UPDATE missing_ranges SET resolved_at = ?
                WHERE start_hour = ? AND end_hour = ? AND resolved_at IS NULL
                "#,
            )
            .bind(now.timestamp())
            .bind(range.start_hour)
            .bind(range.end_hour)
            .execute(pool)
            .await?;
            resolved += 1;
        }
    }
    Ok(resolved)
}

/// Hours covered by still-open ranges, oldest first.
pub async fn unresolved_hours(pool: &SqlitePool) -> Result<Vec<ArchiveHour>> {
    let open = load_ranges(pool, true).await?;
    let mut hours: Vec<ArchiveHour> = open
        .iter()
        .flat_map(|r| r.hours())
        .filter_map(ArchiveHour::from_epoch)
        .collect();
    hours.sort_unstable();
    hours.dedup();
    Ok(hours)
}

async fn complete_hours(pool: &SqlitePool) -> Result<HashSet<i64>> {
    let rows = sqlx::query("SELECT file_path FROM processed_files WHERE is_complete = 1")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .filter_map(|r| ArchiveHour::parse(r.get("file_path")))
        .map(|h| h.timestamp().timestamp())
        .collect())
}

async fn load_ranges(pool: &SqlitePool, open_only: bool) -> Result<Vec<MissingRange>> {
    let sql = if open_only {
        "SELECT start_hour, end_hour, detected_at, resolved_at FROM missing_ranges \
         WHERE resolved_at IS NULL ORDER BY start_hour"
    } else {
        "SELECT start_hour, end_hour, detected_at, resolved_at FROM missing_ranges \
         ORDER BY start_hour"
    };
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|r| MissingRange {
            start_hour: r.get("start_hour"),
            end_hour: r.get("end_hour"),
            detected_at: r.get("detected_at"),
            resolved_at: r.get("resolved_at"),
        })
        .collect())
}
