//! Archive file downloading.
//!
//! Fetches hourly archive files over HTTP with conditional requests,
//! streaming the body to a spool file in the work directory so the
//! compressed archive is never held in memory. Transient failures are
//! retried with exponential backoff plus jitter; a 404 for a past hour is
//! a legitimate permanent gap, not an error to retry.

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::header;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::DownloaderConfig;
use crate::models::ArchiveHour;

/// Errors from fetching one archive file.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeouts, connection resets, 5xx: worth retrying.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The archive hour does not exist upstream.
    #[error("archive file not found")]
    NotFound,

    /// Download exceeded the configured size ceiling. Reported, not
    /// retried.
    #[error("archive file too large: {size} bytes exceeds limit {limit}")]
    TooLarge { size: u64, limit: u64 },

    /// Unexpected non-retryable HTTP status.
    #[error("unexpected HTTP status {0}")]
    Http(u16),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown requested while waiting to retry.
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result of a successful fetch call.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Body written to the spool path.
    Fetched {
        size: u64,
        cache_key: Option<String>,
    },
    /// Upstream content matches our cached key; nothing transferred.
    NotModified,
    /// The hour is permanently absent upstream (404 for a past hour).
    Gone,
}

/// Result of a conditional HEAD probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub exists: bool,
    pub cache_key: Option<String>,
    pub size: Option<u64>,
}

/// Where archive bytes come from. The HTTP implementation is the real
/// source; tests substitute an in-memory one.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// HEAD probe for existence and current cache key.
    async fn probe(&self, hour: &ArchiveHour) -> Result<ProbeResult, FetchError>;

    /// Fetch the archive for `hour` into `dest`, conditionally on
    /// `cached_key` when present.
    async fn fetch(
        &self,
        hour: &ArchiveHour,
        cached_key: Option<&str>,
        dest: &Path,
    ) -> Result<FetchOutcome, FetchError>;
}

/// Exponential backoff schedule with jitter. Pure data so the schedule is
/// testable apart from the fetch loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloaderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before attempt number `attempt` (1-based count of failures so
    /// far), or `None` once the attempt budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
        let capped = exp.min(self.max_delay);
        // Up to 50% jitter to spread retries from concurrent workers.
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64 / 2);
        Some(capped + Duration::from_millis(jitter_ms))
    }
}

/// HTTP archive source against the real gharchive.org URL layout.
pub struct HttpArchiveSource {
    client: reqwest::Client,
    base_url: String,
    max_file_size: u64,
}

impl HttpArchiveSource {
    pub fn new(base_url: String, config: &DownloaderConfig) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("gharvest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            max_file_size: config.max_file_size_bytes,
        })
    }
}

fn transient(e: reqwest::Error) -> FetchError {
    FetchError::Transient(e.to_string())
}

fn etag_of(headers: &header::HeaderMap) -> Option<String> {
    headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[async_trait]
impl ArchiveSource for HttpArchiveSource {
    async fn probe(&self, hour: &ArchiveHour) -> Result<ProbeResult, FetchError> {
        let url = hour.url(&self.base_url);
        let resp = self.client.head(&url).send().await.map_err(transient)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(ProbeResult {
                exists: false,
                cache_key: None,
                size: None,
            }),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(FetchError::Transient(format!("HEAD {url} returned {s}")))
            }
            s if !s.is_success() => Err(FetchError::Http(s.as_u16())),
            _ => Ok(ProbeResult {
                exists: true,
                cache_key: etag_of(resp.headers()),
                size: resp.content_length(),
            }),
        }
    }

    async fn fetch(
        &self,
        hour: &ArchiveHour,
        cached_key: Option<&str>,
        dest: &Path,
    ) -> Result<FetchOutcome, FetchError> {
        let url = hour.url(&self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = cached_key {
            request = request.header(header::IF_NONE_MATCH, key);
        }

        let resp = request.send().await.map_err(transient)?;
        match resp.status() {
            StatusCode::NOT_MODIFIED => return Ok(FetchOutcome::NotModified),
            StatusCode::NOT_FOUND => return Ok(FetchOutcome::Gone),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                return Err(FetchError::Transient(format!("GET {url} returned {s}")))
            }
            s if !s.is_success() => return Err(FetchError::Http(s.as_u16())),
            _ => {}
        }

        // Reject oversized files before transferring when the server
        // advertises a length; enforce exactly while streaming otherwise.
        if let Some(len) = resp.content_length() {
            if len > self.max_file_size {
                return Err(FetchError::TooLarge {
                    size: len,
                    limit: self.max_file_size,
                });
            }
        }

        let cache_key = etag_of(resp.headers());
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut size: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transient)?;
            size += chunk.len() as u64;
            if size > self.max_file_size {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(FetchError::TooLarge {
                    size,
                    limit: self.max_file_size,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(FetchOutcome::Fetched { size, cache_key })
    }
}

/// Drive a fetch through the retry schedule. Only transient errors are
/// retried; cancellation is honored during backoff waits, never by
/// aborting an in-flight request.
pub async fn fetch_with_retry(
    source: &dyn ArchiveSource,
    hour: &ArchiveHour,
    cached_key: Option<&str>,
    dest: &Path,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<FetchOutcome, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        match source.fetch(hour, cached_key, dest).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_transient() => {
                attempt += 1;
                match policy.delay_for(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            file = %hour.file_name(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient fetch failure, backing off: {e}"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        }
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Spool file path for one archive hour.
pub fn spool_path(work_dir: &Path, hour: &ArchiveHour) -> PathBuf {
    work_dir.join(hour.file_name())
}
