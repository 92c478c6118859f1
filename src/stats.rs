//! Database statistics and health overview.
//!
//! Provides a quick summary of what's ingested: event counts, dimension
//! counts, per-type breakdowns, and the state of the processing ledger.
//! Used by `gharvest stats` to give confidence that catchup runs are
//! keeping pace with the archive.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::models::ArchiveHour;

/// Per-event-type breakdown.
struct TypeStats {
    event_type: String,
    count: i64,
    last_created_ts: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM github_events")
        .fetch_one(&pool)
        .await?;

    let total_actors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM actors")
        .fetch_one(&pool)
        .await?;

    let total_repos: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
        .fetch_one(&pool)
        .await?;

    let complete_files: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_files WHERE is_complete = 1")
            .fetch_one(&pool)
            .await?;

    let incomplete_files: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_files WHERE is_complete = 0")
            .fetch_one(&pool)
            .await?;

    let open_gaps: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM missing_ranges WHERE resolved_at IS NULL")
            .fetch_one(&pool)
            .await?;

    // Unpadded hour components break lexicographic ordering, so the
    // frontier is the max by parsed hour, not by file name.
    let frontier = {
        let rows = sqlx::query("SELECT file_path FROM processed_files WHERE is_complete = 1")
            .fetch_all(&pool)
            .await?;
        rows.iter()
            .filter_map(|r| ArchiveHour::parse(r.get("file_path")))
            .max()
    };

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("gharvest — Database Stats");
    println!("=========================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Events:       {}", total_events);
    println!("  Actors:       {}", total_actors);
    println!("  Repositories: {}", total_repos);
    println!();
    println!(
        "  Files:        {} complete, {} incomplete",
        complete_files, incomplete_files
    );
    println!("  Open gaps:    {}", open_gaps);
    if let Some(hour) = frontier {
        println!("  Frontier:     {}", hour);
    }

    // Per-type breakdown
    let type_rows = sqlx::query(
        r#"
        SELECT type, COUNT(*) AS count, MAX(created_at) AS last_created
        FROM github_events
        GROUP BY type
        ORDER BY count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let type_stats: Vec<TypeStats> = type_rows
        .iter()
        .map(|row| TypeStats {
            event_type: row.get("type"),
            count: row.get("count"),
            last_created_ts: row.get("last_created"),
        })
        .collect();

    if !type_stats.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<32} {:>10}   {}", "TYPE", "EVENTS", "LAST SEEN");
        println!("  {}", "-".repeat(60));
        for s in &type_stats {
            let seen = match s.last_created_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!("  {:<32} {:>10}   {}", s.event_type, s.count, seen);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
