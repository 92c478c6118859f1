//! Host resource monitoring.
//!
//! Samples memory, CPU, and disk on a fixed interval, independent of
//! pipeline progress, and publishes the latest reading through a watch
//! channel. The orchestrator gates new work on the derived pressure level;
//! a critical episode additionally triggers a debounced emergency cleanup.
//!
//! Resource protection is best-effort: a failed sample is logged and
//! treated as Normal rather than halting ingestion.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ResourceConfig;
use crate::models::{Pressure, ResourceSnapshot};
use crate::status::PipelineStatus;

/// Classify a snapshot against configured percentage thresholds. The worst
/// of the memory, disk, and CPU ratios decides the level.
pub fn classify(snapshot: &ResourceSnapshot, config: &ResourceConfig) -> Pressure {
    let mut worst: f64 = 0.0;
    if snapshot.memory_limit > 0 {
        worst = worst.max(snapshot.memory_used as f64 / snapshot.memory_limit as f64 * 100.0);
    }
    if snapshot.disk_limit > 0 {
        worst = worst.max(snapshot.disk_used as f64 / snapshot.disk_limit as f64 * 100.0);
    }
    worst = worst.max(snapshot.cpu_load as f64);

    if worst >= config.critical_pct {
        Pressure::Critical
    } else if worst >= config.warning_pct {
        Pressure::Warning
    } else {
        Pressure::Normal
    }
}

/// Delete orphaned download spool files left behind by crashed or aborted
/// runs. Active downloads are recent, so only files older than `max_age`
/// are removed. Returns the number of files deleted.
pub fn clean_work_dir(work_dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut removed = 0;
    if !work_dir.exists() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(work_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| m.elapsed().ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

type CriticalHook = Box<dyn Fn(&ResourceSnapshot) + Send + Sync>;

pub struct ResourceMonitor {
    config: ResourceConfig,
    work_dir: PathBuf,
    tx: watch::Sender<ResourceSnapshot>,
    hooks: Mutex<Vec<CriticalHook>>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceConfig, work_dir: PathBuf) -> Self {
        let (tx, _) = watch::channel(ResourceSnapshot::default());
        Self {
            config,
            work_dir,
            tx,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Receiver for the latest snapshot. The initial value is an empty
    /// snapshot, which classifies as Normal.
    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.tx.subscribe()
    }

    /// Register a handler invoked at most once per critical episode.
    pub fn on_critical<F>(&self, hook: F)
    where
        F: Fn(&ResourceSnapshot) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(Box::new(hook));
        }
    }

    /// Take one resource reading.
    fn sample(&self, sys: &mut System) -> Result<ResourceSnapshot> {
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let total_memory = sys.total_memory();
        if total_memory == 0 {
            bail!("host reports zero total memory");
        }
        let memory_limit = if self.config.memory_limit_gb > 0.0 {
            (self.config.memory_limit_gb * 1024.0 * 1024.0 * 1024.0) as u64
        } else {
            total_memory
        };
        let cpu_load = sys.global_cpu_info().cpu_usage();

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disk_for(&disks, &self.work_dir)?;
        let disk_limit = if self.config.disk_limit_gb > 0.0 {
            (self.config.disk_limit_gb * 1024.0 * 1024.0 * 1024.0) as u64
        } else {
            disk_total
        };

        Ok(ResourceSnapshot {
            memory_used: sys.used_memory(),
            memory_limit,
            cpu_load,
            disk_used: disk_total.saturating_sub(disk_available),
            disk_limit,
        })
    }

    /// Run the sampling loop until cancelled. Publishes each snapshot,
    /// appends a `system_metrics` row, prunes aged rows, and fires the
    /// critical hooks once per episode.
    pub async fn run(
        self: Arc<Self>,
        pool: SqlitePool,
        status: Arc<PipelineStatus>,
        cancel: CancellationToken,
    ) {
        let mut sys = System::new();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sample_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut in_critical = false;
        let mut last_events = status.events_ingested();
        let mut last_errors = status.error_count();
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let snapshot = match self.sample(&mut sys) {
                Ok(s) => s,
                Err(e) => {
                    // Fail open: resource protection is not safety-critical.
                    tracing::warn!("resource sample failed, assuming normal: {e}");
                    ResourceSnapshot::default()
                }
            };

            status.set_resource(snapshot.clone());
            let _ = self.tx.send(snapshot.clone());

            let now = Instant::now();
            let elapsed = now.duration_since(last_tick).as_secs_f64().max(0.001);
            let events = status.events_ingested();
            let errors = status.error_count();
            let events_per_second = (events - last_events) as f64 / elapsed;
            let error_rate = (errors - last_errors) as f64 / elapsed;
            last_events = events;
            last_errors = errors;
            last_tick = now;

            if let Err(e) =
                record_sample(&pool, &snapshot, events_per_second, error_rate).await
            {
                tracing::warn!("failed to record metrics sample: {e}");
            }
            if let Err(e) = prune_samples(&pool, self.config.metrics_retention_hours).await {
                tracing::warn!("failed to prune metrics: {e}");
            }

            match classify(&snapshot, &self.config) {
                Pressure::Critical => {
                    if !in_critical {
                        in_critical = true;
                        tracing::warn!(
                            memory_used = snapshot.memory_used,
                            disk_used = snapshot.disk_used,
                            cpu_load = snapshot.cpu_load,
                            "resource pressure critical, running emergency cleanup"
                        );
                        self.emergency_cleanup(&pool, &snapshot).await;
                    }
                }
                _ => in_critical = false,
            }
        }
    }

    async fn emergency_cleanup(&self, pool: &SqlitePool, snapshot: &ResourceSnapshot) {
        match clean_work_dir(&self.work_dir, Duration::from_secs(600)) {
            Ok(n) if n > 0 => tracing::info!("removed {n} orphaned spool files"),
            Ok(_) => {}
            Err(e) => tracing::warn!("work dir cleanup failed: {e}"),
        }
        // Shed the cheapest disk weight we own: aged metrics rows.
        if let Err(e) = prune_samples(pool, self.config.metrics_retention_hours.min(1)).await {
            tracing::warn!("metrics prune during cleanup failed: {e}");
        }
        if let Ok(hooks) = self.hooks.lock() {
            for hook in hooks.iter() {
                hook(snapshot);
            }
        }
    }
}

fn disk_for(disks: &Disks, work_dir: &Path) -> Result<(u64, u64)> {
    let target = work_dir
        .canonicalize()
        .unwrap_or_else(|_| work_dir.to_path_buf());

    // Longest mount point that prefixes the work dir wins.
    let mut best: Option<(usize, u64, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(d, _, _)| depth > d).unwrap_or(true) {
                best = Some((depth, disk.total_space(), disk.available_space()));
            }
        }
    }
    match best.or_else(|| {
        disks
            .list()
            .first()
            .map(|d| (0, d.total_space(), d.available_space()))
    }) {
        Some((_, total, available)) if total > 0 => Ok((total, available)),
        _ => bail!("no disk information available"),
    }
}

async fn record_sample(
    pool: &SqlitePool,
    snapshot: &ResourceSnapshot,
    events_per_second: f64,
    error_rate: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO system_metrics
            (timestamp, memory_used, memory_limit, cpu_load, disk_used, disk_limit,
             events_per_second, error_rate)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(chrono::Utc::now().timestamp())
    .bind(snapshot.memory_used as i64)
    .bind(snapshot.memory_limit as i64)
    .bind(snapshot.cpu_load as f64)
    .bind(snapshot.disk_used as i64)
    .bind(snapshot.disk_limit as i64)
    .bind(events_per_second)
    .bind(error_rate)
    .execute(pool)
    .await?;
    Ok(())
}

async fn prune_samples(pool: &SqlitePool, retention_hours: i64) -> Result<()> {
    let cutoff = chrono::Utc::now().timestamp() - retention_hours * 3600;
    sqlx::query("DELETE FROM system_metrics WHERE timestamp < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(())
}
