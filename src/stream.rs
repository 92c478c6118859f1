//! Streaming archive decode and validation.
//!
//! Decompresses and parses an archive file as a lazy sequence of validated
//! events: one gzip stream, one JSON document per line, never the whole
//! decompressed file in memory. Malformed records are skipped and counted,
//! not fatal to the file; numeric-looking string ids are coerced with a
//! null sentinel fallback; unknown event kinds land in the `Other` bucket.

use flate2::read::GzDecoder;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::models::{ActorRef, ArchiveHour, EventKind, ParseStats, RepoRef, ValidatedEvent};

/// Coerce a JSON value into an i64. Numbers pass through; numeric-looking
/// strings are parsed. Anything else (or an overflowing value) becomes
/// `None` rather than aborting the record.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn string_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Validate and normalize one raw JSON line into an event.
///
/// Required shape: an `id` (string or number), a `type` string, and a
/// parseable `created_at` timestamp. Actor and repo blocks are optional;
/// a block whose id cannot be coerced is dropped to the null sentinel.
pub fn validate_record(line: &str) -> Option<ValidatedEvent> {
    let raw: Value = serde_json::from_str(line).ok()?;

    let id = match raw.get("id")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let kind = EventKind::parse(raw.get("type")?.as_str()?);
    let created_at = raw
        .get("created_at")?
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))?;

    let actor = raw.get("actor").and_then(|a| {
        let id = coerce_i64(a.get("id")?)?;
        let login = string_field(a, "login")?;
        Some(ActorRef {
            id,
            login,
            display_login: string_field(a, "display_login"),
            avatar_url: string_field(a, "avatar_url"),
        })
    });

    let repo = raw.get("repo").and_then(|r| {
        let id = coerce_i64(r.get("id")?)?;
        let full_name = string_field(r, "name")?;
        Some(RepoRef {
            id,
            full_name,
            url: string_field(r, "url"),
        })
    });

    let payload = raw.get("payload").cloned().unwrap_or(Value::Null);

    Some(ValidatedEvent {
        id,
        kind,
        created_at,
        actor,
        repo,
        payload,
    })
}

/// Lazy event sequence over one decompressed archive. Finite and not
/// restartable; supply a fresh reader to re-parse.
pub struct EventStream<R: BufRead> {
    reader: R,
    line: String,
    stats: ParseStats,
    provenance: String,
}

/// An [`EventStream`] over a gzip-compressed spool file.
pub type GzEventStream = EventStream<BufReader<GzDecoder<BufReader<File>>>>;

impl GzEventStream {
    pub fn open(path: &Path, hour: &ArchiveHour) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        Ok(EventStream::new(
            BufReader::new(decoder),
            hour.file_name(),
        ))
    }
}

impl<R: BufRead> EventStream<R> {
    pub fn new(reader: R, provenance: String) -> Self {
        Self {
            reader,
            line: String::new(),
            stats: ParseStats::default(),
            provenance,
        }
    }

    /// Next validated event, skipping (and counting) malformed records.
    /// `Ok(None)` at end of stream. I/O errors (e.g. a truncated gzip
    /// stream) are fatal to the file, not skippable.
    pub fn next_event(&mut self) -> std::io::Result<Option<ValidatedEvent>> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            match validate_record(line) {
                Some(event) => {
                    self.stats.accepted += 1;
                    return Ok(Some(event));
                }
                None => {
                    self.stats.rejected += 1;
                    tracing::debug!(
                        file = %self.provenance,
                        rejected = self.stats.rejected,
                        "skipped malformed record"
                    );
                }
            }
        }
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_line(id: u64) -> String {
        json!({
            "id": id.to_string(),
            "type": "PushEvent",
            "created_at": "2024-01-15T03:00:59Z",
            "actor": {"id": "42", "login": "octocat"},
            "repo": {"id": 7, "name": "octo/hello"},
            "payload": {"size": 1}
        })
        .to_string()
    }

    #[test]
    fn coercion_handles_numbers_strings_and_garbage() {
        assert_eq!(coerce_i64(&json!(42)), Some(42));
        assert_eq!(coerce_i64(&json!("42")), Some(42));
        assert_eq!(coerce_i64(&json!(" 42 ")), Some(42));
        assert_eq!(coerce_i64(&json!("forty-two")), None);
        assert_eq!(coerce_i64(&json!(null)), None);
        assert_eq!(coerce_i64(&json!(1.5)), None);
        // Overflow falls back to the sentinel, it does not abort.
        assert_eq!(coerce_i64(&json!("99999999999999999999999")), None);
    }

    #[test]
    fn validates_a_normal_event() {
        let event = validate_record(&valid_line(1)).unwrap();
        assert_eq!(event.id, "1");
        assert_eq!(event.kind, EventKind::Push);
        assert_eq!(event.actor.as_ref().unwrap().id, 42);
        assert_eq!(event.repo.as_ref().unwrap().full_name, "octo/hello");
        assert_eq!(event.payload["size"], 1);
    }

    #[test]
    fn uncoercible_actor_id_becomes_null_sentinel() {
        let line = json!({
            "id": "5",
            "type": "WatchEvent",
            "created_at": "2024-01-15T03:00:59Z",
            "actor": {"id": "not-a-number", "login": "octocat"}
        })
        .to_string();
        let event = validate_record(&line).unwrap();
        assert!(event.actor.is_none());
        assert!(event.repo.is_none());
    }

    #[test]
    fn missing_required_fields_reject_the_record() {
        assert!(validate_record("not json").is_none());
        assert!(validate_record("{}").is_none());
        assert!(validate_record(r#"{"id":"1","type":"PushEvent"}"#).is_none());
        assert!(
            validate_record(r#"{"id":"1","type":"PushEvent","created_at":"yesterday"}"#).is_none()
        );
    }

    #[test]
    fn unknown_type_is_kept_as_other() {
        let line = json!({
            "id": "9",
            "type": "BrandNewEvent",
            "created_at": "2024-01-15T03:00:59Z"
        })
        .to_string();
        let event = validate_record(&line).unwrap();
        assert_eq!(event.kind, EventKind::Other("BrandNewEvent".into()));
    }

    #[test]
    fn stream_skips_malformed_and_counts_both() {
        let mut body = String::new();
        body.push_str(&valid_line(1));
        body.push('\n');
        body.push_str("this is not json\n");
        body.push('\n'); // blank lines are not records at all
        body.push_str(&valid_line(2));
        body.push('\n');

        let mut stream = EventStream::new(body.as_bytes(), "test".into());
        let mut ids = Vec::new();
        while let Some(event) = stream.next_event().unwrap() {
            ids.push(event.id);
        }
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(
            stream.stats(),
            ParseStats {
                accepted: 2,
                rejected: 1
            }
        );
    }

    #[test]
    fn gzip_stream_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for i in 0..5u64 {
            writeln!(encoder, "{}", valid_line(i)).unwrap();
        }
        let compressed = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-01-15-3.json.gz");
        std::fs::write(&path, compressed).unwrap();

        let hour = ArchiveHour::new(
            chrono::NaiveDate::parse_from_str("2024-01-15", "%Y-%m-%d").unwrap(),
            3,
        );
        let mut stream = GzEventStream::open(&path, &hour).unwrap();
        let mut count = 0;
        while stream.next_event().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
        assert_eq!(stream.stats().accepted, 5);
    }

    #[test]
    fn truncated_gzip_is_a_hard_error() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for i in 0..50u64 {
            writeln!(encoder, "{}", valid_line(i)).unwrap();
        }
        let mut compressed = encoder.finish().unwrap();
        compressed.truncate(compressed.len() / 2);

        let mut stream = EventStream::new(
            BufReader::new(GzDecoder::new(&compressed[..])),
            "truncated".into(),
        );
        let mut saw_error = false;
        loop {
            match stream.next_event() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error, "truncated stream must surface an i/o error");
    }
}
