//! Records: what fetch services produce and what the engine archives.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};

use super::attachment::{Attachment, RawAttachment};
use crate::error::{ArchiveError, Result};

/// A candidate record exactly as the source reported it.
///
/// Everything except `id` is optional; [`Record::ingest`] validates and
/// defaults the fields in a single pass.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    pub id: String,
    pub thread_id: Option<String>,
    /// Unparsed timestamp text (`Date:` header, RFC 3339, …).
    pub timestamp: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub labels: Vec<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    /// `None` slots stand for attachment objects the source could not provide.
    pub attachments: Vec<Option<RawAttachment>>,
}

/// A validated, immutable record.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    pub thread_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub labels: BTreeSet<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub attachments: Vec<Option<Attachment>>,
}

impl Record {
    /// Validate a raw record.
    ///
    /// Fails with `InvalidInput` when the id is blank and with
    /// `ValidationRejected` when the timestamp is missing or unparseable.
    /// A bad timestamp is never replaced by the current time.
    pub fn ingest(raw: RawRecord) -> Result<Self> {
        let id = raw.id.trim().to_string();
        if id.is_empty() {
            return Err(ArchiveError::InvalidInput("record id is empty".into()));
        }

        let raw_ts = raw.timestamp.as_deref().unwrap_or("");
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            ArchiveError::rejected(
                format!("record {id}"),
                format!("unparseable timestamp '{raw_ts}'"),
            )
        })?;

        let labels = raw
            .labels
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        Ok(Self {
            id,
            thread_id: raw.thread_id.filter(|t| !t.trim().is_empty()),
            timestamp,
            subject: raw.subject.map(|s| s.trim().to_string()).unwrap_or_default(),
            from: raw.from.unwrap_or_default(),
            to: raw.to.unwrap_or_default(),
            cc: raw.cc.unwrap_or_default(),
            labels,
            html_body: raw.html_body.filter(|b| !b.trim().is_empty()),
            text_body: raw.text_body.filter(|b| !b.trim().is_empty()),
            attachments: raw
                .attachments
                .into_iter()
                .map(|slot| slot.map(Attachment::from))
                .collect(),
        })
    }

    /// First 8 hex characters of the SHA-256 of the id.
    ///
    /// Ids may contain anything (`<abc@mail.gmail.com>`), so the hash is what
    /// ends up in folder names.
    pub fn short_id(&self) -> String {
        short_hash(&self.id)
    }

    /// The subject cut to `max_chars` for diagnostics.
    pub fn subject_snapshot(&self, max_chars: usize) -> String {
        let clean: String = self.subject.chars().filter(|c| !c.is_control()).collect();
        if clean.chars().count() > max_chars {
            let mut s: String = clean.chars().take(max_chars).collect();
            s.push('…');
            s
        } else {
            clean
        }
    }
}

/// First 8 hex characters of the SHA-256 of `value`.
pub fn short_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..8].to_string()
}

/// Parse a record timestamp in the formats mail sources commonly produce.
///
/// Tries RFC 3339, RFC 2822, then a handful of broken real-world variants.
/// Returns `None` instead of guessing.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    // Drop a trailing comment such as "(UTC)" and a leading day-of-week.
    let no_comment = match trimmed.find(" (") {
        Some(pos) => trimmed[..pos].trim(),
        None => trimmed,
    };
    if let Ok(dt) = DateTime::parse_from_rfc2822(no_comment) {
        return Some(dt.with_timezone(&Utc));
    }
    let no_dow = no_comment
        .split_once(", ")
        .filter(|(dow, _)| dow.len() == 3 && dow.chars().all(|c| c.is_ascii_alphabetic()))
        .map(|(_, rest)| rest)
        .unwrap_or(no_comment);

    let formats = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M %z",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%d %H:%M:%S %z",
    ];
    for fmt in &formats {
        if let Ok(dt) = DateTime::parse_from_str(no_dow, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive_formats = ["%d %b %Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    for fmt in &naive_formats {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(no_dow, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    // asctime, as found on MBOX "From " lines: "Thu Jan  1 00:00:00 2024"
    let collapsed = no_dow.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Ok(ndt) = NaiveDateTime::parse_from_str(&collapsed, "%a %b %d %H:%M:%S %Y") {
        return Some(Utc.from_utc_datetime(&ndt));
    }

    // Numeric epoch seconds (some exports store internal dates this way)
    if no_dow.len() >= 9 && no_dow.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(secs) = no_dow.parse::<i64>() {
            return DateTime::from_timestamp(secs, 0);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    fn raw(id: &str, ts: Option<&str>) -> RawRecord {
        RawRecord {
            id: id.to_string(),
            timestamp: ts.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_rfc2822() {
        let dt = parse_timestamp("Thu, 15 Feb 2024 10:30:00 +0100").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-02-15T09:30:00+00:00");
    }

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_timestamp("2023-07-01T12:00:00Z").unwrap();
        assert_eq!(dt.year(), 2023);
    }

    #[test]
    fn test_parse_with_comment() {
        let dt = parse_timestamp("Mon, 1 Jan 2024 08:00:00 +0000 (UTC)").unwrap();
        assert_eq!(dt.month(), 1);
    }

    #[test]
    fn test_parse_naive_and_epoch() {
        assert!(parse_timestamp("2022-03-04 05:06:07").is_some());
        let dt = parse_timestamp("1700000000").unwrap();
        assert_eq!(dt.year(), 2023);
    }

    #[test]
    fn test_parse_asctime() {
        let dt = parse_timestamp("Thu Feb  1 09:15:00 2024").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-02-01T09:15:00+00:00");
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("2024-13-45T99:00:00Z").is_none());
    }

    #[test]
    fn test_ingest_rejects_bad_timestamp() {
        let err = Record::ingest(raw("m1", Some("yesterday-ish"))).unwrap_err();
        assert!(matches!(err, ArchiveError::ValidationRejected { .. }));
        let err = Record::ingest(raw("m1", None)).unwrap_err();
        assert!(matches!(err, ArchiveError::ValidationRejected { .. }));
    }

    #[test]
    fn test_ingest_rejects_blank_id() {
        let err = Record::ingest(raw("  ", Some("2024-01-01T00:00:00Z"))).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidInput(_)));
    }

    #[test]
    fn test_ingest_defaults() {
        let mut r = raw("m2", Some("2024-01-01T00:00:00Z"));
        r.labels = vec!["Inbox".into(), " ".into(), "Work".into(), "Inbox".into()];
        r.html_body = Some("   ".into());
        r.attachments = vec![None, Some(RawAttachment::default())];
        let rec = Record::ingest(r).unwrap();
        assert_eq!(rec.subject, "");
        assert_eq!(rec.labels.len(), 2);
        assert!(rec.html_body.is_none());
        assert!(rec.attachments[0].is_none());
        assert!(rec.attachments[1].is_some());
    }

    #[test]
    fn test_short_id_stable() {
        let rec = Record::ingest(raw("<abc@mail>", Some("2024-01-01T00:00:00Z"))).unwrap();
        assert_eq!(rec.short_id().len(), 8);
        assert_eq!(rec.short_id(), short_hash("<abc@mail>"));
    }

    #[test]
    fn test_subject_snapshot() {
        let mut r = raw("m3", Some("2024-01-01T00:00:00Z"));
        r.subject = Some("a".repeat(100));
        let rec = Record::ingest(r).unwrap();
        let snap = rec.subject_snapshot(80);
        assert_eq!(snap.chars().count(), 81);
        assert!(snap.ends_with('…'));
    }
}
