use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables and indexes. Idempotent; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Event fact table, keyed by the immutable GitHub event id. actor_id
    // and repo_id are intentionally not FK-enforced so events can land
    // before (or without) their dimension rows.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS github_events (
            event_id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            actor_id INTEGER,
            repo_id INTEGER,
            payload TEXT NOT NULL DEFAULT '{}',
            archive_file TEXT NOT NULL,
            processed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS actors (
            id INTEGER PRIMARY KEY,
            login TEXT NOT NULL,
            display_login TEXT,
            avatar_url TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id INTEGER PRIMARY KEY,
            full_name TEXT NOT NULL,
            url TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_files (
            file_path TEXT PRIMARY KEY,
            file_size INTEGER NOT NULL DEFAULT 0,
            cache_key TEXT,
            event_count INTEGER NOT NULL DEFAULT 0,
            is_complete INTEGER NOT NULL DEFAULT 0,
            processed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS missing_ranges (
            start_hour INTEGER NOT NULL,
            end_hour INTEGER NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER,
            PRIMARY KEY (start_hour, end_hour)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_metrics (
            timestamp INTEGER NOT NULL,
            memory_used INTEGER NOT NULL,
            memory_limit INTEGER NOT NULL,
            cpu_load REAL NOT NULL,
            disk_used INTEGER NOT NULL,
            disk_limit INTEGER NOT NULL,
            events_per_second REAL NOT NULL,
            error_rate REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Lookup paths the external dashboard relies on: by type, actor, repo,
    // and created_at range; archive_file supports completeness audits.
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON github_events(type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_actor ON github_events(actor_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_repo ON github_events(repo_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_created_at ON github_events(created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_archive_file ON github_events(archive_file)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON system_metrics(timestamp)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
