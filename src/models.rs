//! Core data models used throughout gharvest.
//!
//! These types represent the archive hours, events, and reports that flow
//! through the ingestion pipeline.

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use serde::Serialize;
use serde_json::Value;

/// One hourly archive file published by gharchive.org.
///
/// Purely derived from a timestamp; two refs for the same hour are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveHour {
    pub date: NaiveDate,
    pub hour: u8,
}

impl ArchiveHour {
    pub fn new(date: NaiveDate, hour: u8) -> Self {
        debug_assert!(hour < 24);
        Self { date, hour }
    }

    /// The archive file name as published, e.g. `2024-01-15-3.json.gz`.
    /// The hour component is not zero-padded.
    pub fn file_name(&self) -> String {
        format!("{}-{}.json.gz", self.date.format("%Y-%m-%d"), self.hour)
    }

    /// Full download URL under the given base (trailing slash optional).
    pub fn url(&self, base: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), self.file_name())
    }

    /// Start of the hour as a UTC timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.date
            .and_hms_opt(self.hour as u32, 0, 0)
            .expect("hour is validated < 24")
            .and_utc()
    }

    /// The archive hour containing the given instant.
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            date: at.date_naive(),
            hour: at.hour() as u8,
        }
    }

    /// The hour immediately after this one.
    pub fn next(&self) -> Self {
        Self::containing(self.timestamp() + chrono::Duration::hours(1))
    }

    /// Parse an archive file name back into its hour.
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".json.gz")?;
        let (date_part, hour_part) = stem.rsplit_once('-')?;
        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
        let hour: u8 = hour_part.parse().ok()?;
        if hour >= 24 {
            return None;
        }
        Some(Self { date, hour })
    }

    /// Reconstruct an hour from an epoch-seconds hour boundary.
    pub fn from_epoch(secs: i64) -> Option<Self> {
        let dt = Utc.timestamp_opt(secs, 0).single()?;
        Some(Self::containing(dt))
    }
}

impl std::fmt::Display for ArchiveHour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:02}", self.date.format("%Y-%m-%d"), self.hour)
    }
}

/// The known GitHub event kinds. Unknown kinds are retained under
/// [`EventKind::Other`] rather than dropped, to tolerate upstream schema
/// drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Push,
    PullRequest,
    Issues,
    IssueComment,
    Watch,
    Fork,
    Create,
    Delete,
    Release,
    Public,
    Member,
    Gollum,
    CommitComment,
    PullRequestReview,
    PullRequestReviewComment,
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PushEvent" => Self::Push,
            "PullRequestEvent" => Self::PullRequest,
            "IssuesEvent" => Self::Issues,
            "IssueCommentEvent" => Self::IssueComment,
            "WatchEvent" => Self::Watch,
            "ForkEvent" => Self::Fork,
            "CreateEvent" => Self::Create,
            "DeleteEvent" => Self::Delete,
            "ReleaseEvent" => Self::Release,
            "PublicEvent" => Self::Public,
            "MemberEvent" => Self::Member,
            "GollumEvent" => Self::Gollum,
            "CommitCommentEvent" => Self::CommitComment,
            "PullRequestReviewEvent" => Self::PullRequestReview,
            "PullRequestReviewCommentEvent" => Self::PullRequestReviewComment,
            other => Self::Other(other.to_string()),
        }
    }

    /// The source's type string, preserved verbatim for unknown kinds.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Push => "PushEvent",
            Self::PullRequest => "PullRequestEvent",
            Self::Issues => "IssuesEvent",
            Self::IssueComment => "IssueCommentEvent",
            Self::Watch => "WatchEvent",
            Self::Fork => "ForkEvent",
            Self::Create => "CreateEvent",
            Self::Delete => "DeleteEvent",
            Self::Release => "ReleaseEvent",
            Self::Public => "PublicEvent",
            Self::Member => "MemberEvent",
            Self::Gollum => "GollumEvent",
            Self::CommitComment => "CommitCommentEvent",
            Self::PullRequestReview => "PullRequestReviewEvent",
            Self::PullRequestReviewComment => "PullRequestReviewCommentEvent",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

/// Actor dimension row carried on a validated event.
#[derive(Debug, Clone)]
pub struct ActorRef {
    pub id: i64,
    pub login: String,
    pub display_login: Option<String>,
    pub avatar_url: Option<String>,
}

/// Repository dimension row carried on a validated event.
#[derive(Debug, Clone)]
pub struct RepoRef {
    pub id: i64,
    pub full_name: String,
    pub url: Option<String>,
}

/// A structurally validated, normalized event ready for ingestion.
#[derive(Debug, Clone)]
pub struct ValidatedEvent {
    /// Immutable GitHub event id (natural idempotency key).
    pub id: String,
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
    /// Missing or uncoercible actor ids become `None` rather than failing
    /// the record.
    pub actor: Option<ActorRef>,
    pub repo: Option<RepoRef>,
    /// Opaque structured payload, stored as-is.
    pub payload: Value,
}

/// Running accept/reject counts for one archive file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Outcome counts from ingesting one archive file.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestReport {
    pub accepted: u64,
    pub duplicates: u64,
    pub failed: u64,
}

/// Persisted processing state for one archive file.
#[derive(Debug, Clone)]
pub struct ProcessedFile {
    pub file_path: String,
    pub file_size: i64,
    pub cache_key: Option<String>,
    pub event_count: i64,
    pub is_complete: bool,
    pub processed_at: i64,
}

/// A contiguous span of archive hours believed absent or incomplete.
/// `start_hour`/`end_hour` are inclusive epoch-seconds hour boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingRange {
    pub start_hour: i64,
    pub end_hour: i64,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}

impl MissingRange {
    pub fn hours(&self) -> impl Iterator<Item = i64> {
        (self.start_hour..=self.end_hour).step_by(3600)
    }

    pub fn contains(&self, hour_epoch: i64) -> bool {
        hour_epoch >= self.start_hour && hour_epoch <= self.end_hour
    }
}

/// A point-in-time reading of host resources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceSnapshot {
    pub memory_used: u64,
    pub memory_limit: u64,
    pub cpu_load: f32,
    pub disk_used: u64,
    pub disk_limit: u64,
}

/// Coarse classification of host resource headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
    Normal,
    Warning,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn file_name_is_unpadded() {
        let hour = ArchiveHour::new(date("2024-01-15"), 3);
        assert_eq!(hour.file_name(), "2024-01-15-3.json.gz");
        assert_eq!(
            hour.url("https://data.gharchive.org/"),
            "https://data.gharchive.org/2024-01-15-3.json.gz"
        );
    }

    #[test]
    fn parse_round_trips() {
        for h in [0u8, 9, 10, 23] {
            let hour = ArchiveHour::new(date("2023-06-30"), h);
            assert_eq!(ArchiveHour::parse(&hour.file_name()), Some(hour));
        }
        assert_eq!(ArchiveHour::parse("2023-06-30-24.json.gz"), None);
        assert_eq!(ArchiveHour::parse("garbage"), None);
        assert_eq!(ArchiveHour::parse("2023-06-30-5.json"), None);
    }

    #[test]
    fn next_crosses_midnight() {
        let hour = ArchiveHour::new(date("2024-02-29"), 23);
        let next = hour.next();
        assert_eq!(next.date, date("2024-03-01"));
        assert_eq!(next.hour, 0);
    }

    #[test]
    fn epoch_round_trips() {
        let hour = ArchiveHour::new(date("2024-01-15"), 7);
        let secs = hour.timestamp().timestamp();
        assert_eq!(ArchiveHour::from_epoch(secs), Some(hour));
    }

    #[test]
    fn unknown_kind_is_retained() {
        let kind = EventKind::parse("SponsorshipEvent");
        assert!(!kind.is_known());
        assert_eq!(kind.as_str(), "SponsorshipEvent");
        assert_eq!(EventKind::parse("PushEvent"), EventKind::Push);
        assert!(EventKind::parse("PushEvent").is_known());
    }

    #[test]
    fn missing_range_hours() {
        let start = ArchiveHour::new(date("2024-01-15"), 3).timestamp().timestamp();
        let end = ArchiveHour::new(date("2024-01-15"), 5).timestamp().timestamp();
        let range = MissingRange {
            start_hour: start,
            end_hour: end,
            detected_at: 0,
            resolved_at: None,
        };
        assert_eq!(range.hours().count(), 3);
        assert!(range.contains(start + 3600));
        assert!(!range.contains(end + 3600));
    }
}
