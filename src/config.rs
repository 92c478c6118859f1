use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Base URL of the hourly archive files.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Scratch directory for in-flight downloads.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Hours to hold back from "now": the most recent archives may still be
    /// finalizing upstream and are deferred, not treated as missing.
    #[serde(default = "default_safety_margin_hours")]
    pub safety_margin_hours: i64,

    /// Window within which completed recent files are re-probed for a
    /// changed upstream cache key.
    #[serde(default = "default_recheck_hours")]
    pub recheck_hours: i64,

    /// How far back catchup mode starts when the store is empty.
    #[serde(default = "default_backfill_hours")]
    pub default_backfill_hours: i64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            work_dir: default_work_dir(),
            safety_margin_hours: default_safety_margin_hours(),
            recheck_hours: default_recheck_hours(),
            default_backfill_hours: default_backfill_hours(),
        }
    }
}

fn default_base_url() -> String {
    "https://data.gharchive.org".to_string()
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("./data/incoming")
}
fn default_safety_margin_hours() -> i64 {
    2
}
fn default_recheck_hours() -> i64 {
    24
}
fn default_backfill_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloaderConfig {
    /// Maximum concurrently in-flight archive files.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum fetch attempts per file (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Downloads larger than this are aborted, reported, and not retried.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_file_size_bytes: default_max_file_size(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_max_file_size() -> u64 {
    512 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Events per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pending batches buffered between the parser and the store. The
    /// parser blocks when this queue is full (backpressure).
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}
fn default_queue_depth() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResourceConfig {
    /// Memory budget in GiB. 0 means "total host memory".
    #[serde(default)]
    pub memory_limit_gb: f64,

    /// Disk budget in GiB for the filesystem holding the work dir.
    /// 0 means "total filesystem capacity".
    #[serde(default)]
    pub disk_limit_gb: f64,

    #[serde(default = "default_warning_pct")]
    pub warning_pct: f64,

    #[serde(default = "default_critical_pct")]
    pub critical_pct: f64,

    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,

    /// Age after which system_metrics rows are pruned.
    #[serde(default = "default_metrics_retention_hours")]
    pub metrics_retention_hours: i64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_limit_gb: 0.0,
            disk_limit_gb: 0.0,
            warning_pct: default_warning_pct(),
            critical_pct: default_critical_pct(),
            sample_interval_secs: default_sample_interval_secs(),
            metrics_retention_hours: default_metrics_retention_hours(),
        }
    }
}

fn default_warning_pct() -> f64 {
    80.0
}
fn default_critical_pct() -> f64 {
    92.0
}
fn default_sample_interval_secs() -> u64 {
    5
}
fn default_metrics_retention_hours() -> i64 {
    72
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.downloader.max_concurrent == 0 {
        anyhow::bail!("downloader.max_concurrent must be >= 1");
    }
    if config.downloader.max_attempts == 0 {
        anyhow::bail!("downloader.max_attempts must be >= 1");
    }
    if config.ingest.batch_size == 0 {
        anyhow::bail!("ingest.batch_size must be >= 1");
    }
    if config.ingest.queue_depth == 0 {
        anyhow::bail!("ingest.queue_depth must be >= 1");
    }
    if config.archive.safety_margin_hours < 0 {
        anyhow::bail!("archive.safety_margin_hours must be >= 0");
    }
    if config.resources.warning_pct <= 0.0 || config.resources.warning_pct > 100.0 {
        anyhow::bail!("resources.warning_pct must be in (0, 100]");
    }
    if config.resources.critical_pct <= config.resources.warning_pct
        || config.resources.critical_pct > 100.0
    {
        anyhow::bail!("resources.critical_pct must be in (warning_pct, 100]");
    }
    if config.resources.sample_interval_secs == 0 {
        anyhow::bail!("resources.sample_interval_secs must be >= 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "./data/gharvest.sqlite"
            "#,
        )
        .unwrap();
        validate(&config).unwrap();
        assert_eq!(config.archive.base_url, "https://data.gharchive.org");
        assert_eq!(config.downloader.max_concurrent, 4);
        assert_eq!(config.ingest.batch_size, 500);
        assert_eq!(config.resources.critical_pct, 92.0);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "./x.sqlite"

            [resources]
            warning_pct = 90.0
            critical_pct = 85.0
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "./x.sqlite"

            [downloader]
            max_concurrent = 0
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }
}
