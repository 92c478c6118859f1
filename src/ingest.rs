//! Transactional batch ingestion.
//!
//! Writes validated events and their actor/repo dimension rows in one
//! transaction per batch. Idempotency rides on the immutable event id:
//! replays insert nothing and are counted as duplicates, so re-running a
//! file is always safe. A failed batch is retried once before the file is
//! declared incomplete.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::config::IngestConfig;
use crate::models::{ActorRef, IngestReport, RepoRef, ValidatedEvent};

pub struct BatchIngestor {
    pool: SqlitePool,
    batch_size: usize,
}

impl BatchIngestor {
    pub fn new(pool: SqlitePool, config: &IngestConfig) -> Self {
        Self {
            pool,
            batch_size: config.batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Ingest one batch, retrying once on storage failure. Returns how many
    /// events were newly inserted and how many were already present.
    pub async fn ingest_batch(
        &self,
        events: &[ValidatedEvent],
        archive_file: &str,
    ) -> Result<IngestReport> {
        match self.apply_batch(events, archive_file).await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::warn!(file = archive_file, "batch write failed, retrying once: {e}");
                self.apply_batch(events, archive_file)
                    .await
                    .context("batch write failed after retry")
            }
        }
    }

    async fn apply_batch(
        &self,
        events: &[ValidatedEvent],
        archive_file: &str,
    ) -> Result<IngestReport> {
        let mut tx = self.pool.begin().await?;
        let processed_at = chrono::Utc::now().timestamp();

        // Dimension rows first, deduplicated by id so a hot actor or repo
        // is written once per batch.
        let mut actors: BTreeMap<i64, &ActorRef> = BTreeMap::new();
        let mut repos: BTreeMap<i64, &RepoRef> = BTreeMap::new();
        for event in events {
            if let Some(actor) = &event.actor {
                actors.insert(actor.id, actor);
            }
            if let Some(repo) = &event.repo {
                repos.insert(repo.id, repo);
            }
        }

        for actor in actors.values() {
            sqlx::query(
                r#"
                INSERT INTO actors (id, login, display_login, avatar_url)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    login = excluded.login,
                    display_login = COALESCE(excluded.display_login, actors.display_login),
                    avatar_url = COALESCE(excluded.avatar_url, actors.avatar_url)
                "#,
            )
            .bind(actor.id)
            .bind(&actor.login)
            .bind(&actor.display_login)
            .bind(&actor.avatar_url)
            .execute(&mut *tx)
            .await?;
        }

        for repo in repos.values() {
            sqlx::query(
                r#"
                INSERT INTO repositories (id, full_name, url)
                VALUES (?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    full_name = excluded.full_name,
                    url = COALESCE(excluded.url, repositories.url)
                "#,
            )
            .bind(repo.id)
            .bind(&repo.full_name)
            .bind(&repo.url)
            .execute(&mut *tx)
            .await?;
        }

        let mut accepted: u64 = 0;
        for event in events {
            let payload = if event.payload.is_null() {
                "{}".to_string()
            } else {
                serde_json::to_string(&event.payload)?
            };
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO github_events
                    (event_id, type, created_at, actor_id, repo_id, payload,
                     archive_file, processed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.id)
            .bind(event.kind.as_str())
            .bind(event.created_at.timestamp())
            .bind(event.actor.as_ref().map(|a| a.id))
            .bind(event.repo.as_ref().map(|r| r.id))
            .bind(payload)
            .bind(archive_file)
            .bind(processed_at)
            .execute(&mut *tx)
            .await?;
            accepted += result.rows_affected();
        }

        tx.commit().await?;

        Ok(IngestReport {
            accepted,
            duplicates: events.len() as u64 - accepted,
            failed: 0,
        })
    }

    /// Record a fully ingested file in the processing ledger.
    /// `event_count` is the number of events the file contributed,
    /// duplicates included, so replays reproduce the same count.
    pub async fn mark_complete(
        &self,
        file_name: &str,
        file_size: i64,
        cache_key: Option<&str>,
        event_count: i64,
    ) -> Result<()> {
        self.record_file(file_name, file_size, cache_key, event_count, true)
            .await
    }

    /// Record a file that was only partially ingested. The next planning
    /// pass will schedule an unconditional re-fetch.
    pub async fn mark_incomplete(
        &self,
        file_name: &str,
        file_size: i64,
        event_count: i64,
    ) -> Result<()> {
        self.record_file(file_name, file_size, None, event_count, false)
            .await
    }

    async fn record_file(
        &self,
        file_name: &str,
        file_size: i64,
        cache_key: Option<&str>,
        event_count: i64,
        is_complete: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_files
                (file_path, file_size, cache_key, event_count, is_complete, processed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                file_size = excluded.file_size,
                cache_key = excluded.cache_key,
                event_count = excluded.event_count,
                is_complete = excluded.is_complete,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(file_name)
        .bind(file_size)
        .bind(cache_key)
        .bind(event_count)
        .bind(is_complete as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;
    use sqlx::Row;

    async fn ingestor() -> BatchIngestor {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        BatchIngestor::new(pool, &IngestConfig::default())
    }

    fn event(id: &str, actor_id: i64, avatar: Option<&str>) -> ValidatedEvent {
        ValidatedEvent {
            id: id.to_string(),
            kind: EventKind::Push,
            created_at: chrono::Utc::now(),
            actor: Some(ActorRef {
                id: actor_id,
                login: format!("user{actor_id}"),
                display_login: None,
                avatar_url: avatar.map(str::to_string),
            }),
            repo: Some(RepoRef {
                id: 7,
                full_name: "octo/hello".into(),
                url: None,
            }),
            payload: serde_json::json!({"n": 1}),
        }
    }

    #[tokio::test]
    async fn replay_counts_duplicates_not_inserts() {
        let ingestor = ingestor().await;
        let batch: Vec<_> = (0..10).map(|i| event(&i.to_string(), 1, None)).collect();

        let first = ingestor.ingest_batch(&batch, "f.json.gz").await.unwrap();
        assert_eq!(first.accepted, 10);
        assert_eq!(first.duplicates, 0);

        let second = ingestor.ingest_batch(&batch, "f.json.gz").await.unwrap();
        assert_eq!(second.accepted, 0);
        assert_eq!(second.duplicates, 10);

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM github_events")
            .fetch_one(&ingestor.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn partial_overlap_inserts_only_new_events() {
        let ingestor = ingestor().await;
        let first: Vec<_> = (0..5).map(|i| event(&i.to_string(), 1, None)).collect();
        ingestor.ingest_batch(&first, "f.json.gz").await.unwrap();

        let overlap: Vec<_> = (3..8).map(|i| event(&i.to_string(), 1, None)).collect();
        let report = ingestor.ingest_batch(&overlap, "f.json.gz").await.unwrap();
        assert_eq!(report.accepted, 3);
        assert_eq!(report.duplicates, 2);
    }

    #[tokio::test]
    async fn dimension_upsert_keeps_known_fields() {
        let ingestor = ingestor().await;
        ingestor
            .ingest_batch(&[event("1", 42, Some("https://a/img"))], "f.json.gz")
            .await
            .unwrap();
        // Later event for the same actor without an avatar must not erase it.
        ingestor
            .ingest_batch(&[event("2", 42, None)], "f.json.gz")
            .await
            .unwrap();

        let row = sqlx::query("SELECT login, avatar_url FROM actors WHERE id = 42")
            .fetch_one(&ingestor.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("login"), "user42");
        assert_eq!(row.get::<Option<String>, _>("avatar_url").as_deref(), Some("https://a/img"));
    }

    #[tokio::test]
    async fn ledger_upsert_moves_incomplete_to_complete() {
        let ingestor = ingestor().await;
        ingestor.mark_incomplete("f.json.gz", 100, 3).await.unwrap();
        ingestor
            .mark_complete("f.json.gz", 100, Some("\"k\""), 10)
            .await
            .unwrap();

        let row = sqlx::query(
            "SELECT is_complete, event_count, cache_key FROM processed_files WHERE file_path = ?",
        )
        .bind("f.json.gz")
        .fetch_one(&ingestor.pool)
        .await
        .unwrap();
        assert_eq!(row.get::<i64, _>("is_complete"), 1);
        assert_eq!(row.get::<i64, _>("event_count"), 10);
        assert_eq!(row.get::<Option<String>, _>("cache_key").as_deref(), Some("\"k\""));

        let rows: i64 = sqlx::query("SELECT COUNT(*) AS n FROM processed_files")
            .fetch_one(&ingestor.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(rows, 1);
    }
}
