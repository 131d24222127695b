//! Archive layout: `Anchor/YYYY/MM/DD/<record folder>/attachments`.
//!
//! Every folder the resolver hands out descends from the anchor. A store
//! that returns anything else (a folder somewhere else, a folder that is
//! not a direct child of the one asked about) stops the resolution with
//! [`ArchiveError::PathIntegrityViolation`] before anything more is created.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::{find_child, DestinationStore, EntryKind, FolderHandle};
use crate::error::{ArchiveError, Result};
use crate::model::record::Record;
use crate::sanitize::sanitize_segment;

/// Sub-folder holding a record's attachments.
pub const ATTACHMENTS_FOLDER: &str = "attachments";

/// Characters of the subject kept in folder and file names.
pub const SUBJECT_SEGMENT_LEN: usize = 60;

/// UTF-8 bytes of the subject kept in folder and file names. With the
/// timestamp, hash and extension the longest artifact name stays well under
/// the 255-byte segment limit of common filesystems.
pub const SUBJECT_SEGMENT_BYTES: usize = 150;

const UNTITLED: &str = "untitled";

/// The files written for each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Html,
    Text,
    /// Written last; its presence marks the record as complete.
    Metadata,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Html => "html",
            ArtifactKind::Text => "txt",
            ArtifactKind::Metadata => "json",
        }
    }
}

/// `{subject}_{YYYYMMDD_HHMMSS}_{hash}`, used for the record folder and its files.
///
/// Deterministic: the same record always maps to the same name.
pub fn record_base_name(record: &Record) -> String {
    let subject = sanitize_segment(&record.subject, SUBJECT_SEGMENT_LEN, SUBJECT_SEGMENT_BYTES);
    let subject = if subject.is_empty() { UNTITLED } else { &subject };
    format!(
        "{subject}_{}_{}",
        record.timestamp.format("%Y%m%d_%H%M%S"),
        record.short_id()
    )
}

pub fn artifact_name(base: &str, kind: ArtifactKind) -> String {
    format!("{base}.{}", kind.extension())
}

/// Zero-padded `[YYYY, MM, DD]` folder names for a timestamp (UTC).
pub fn date_segments(timestamp: &DateTime<Utc>) -> [String; 3] {
    [
        format!("{:04}", timestamp.year()),
        format!("{:02}", timestamp.month()),
        format!("{:02}", timestamp.day()),
    ]
}

/// Builds and looks up record folders below an anchor.
#[derive(Debug, Clone)]
pub struct PathResolver<D: DestinationStore> {
    store: D,
    anchor: FolderHandle,
}

impl<D: DestinationStore> PathResolver<D> {
    pub fn new(store: D, anchor: FolderHandle) -> Self {
        Self { store, anchor }
    }

    pub fn anchor(&self) -> &FolderHandle {
        &self.anchor
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    /// Create the anchor chain from the store root if it is missing.
    pub fn ensure_anchor(&self) -> Result<FolderHandle> {
        let mut current = FolderHandle::root();
        for segment in self.anchor.segments() {
            current = self.descend(&current, segment)?;
        }
        Ok(current)
    }

    /// Get or create the `YYYY/MM/DD` folder for `timestamp` below `parent`.
    pub fn resolve(&self, parent: &FolderHandle, timestamp: &DateTime<Utc>) -> Result<FolderHandle> {
        if !parent.is_within(&self.anchor) {
            return Err(self.violation(parent));
        }
        let mut current = parent.clone();
        for segment in date_segments(timestamp) {
            current = self.descend(&current, &segment)?;
        }
        Ok(current)
    }

    /// Get or create the record's own folder.
    pub fn resolve_record(&self, record: &Record) -> Result<FolderHandle> {
        let day = self.resolve(&self.anchor, &record.timestamp)?;
        let folder = self.descend(&day, &record_base_name(record))?;
        debug!(record = %record.id, folder = %folder, "Resolved record folder");
        Ok(folder)
    }

    /// Get or create `<record folder>/attachments`.
    pub fn resolve_attachments(&self, record_folder: &FolderHandle) -> Result<FolderHandle> {
        if !record_folder.is_within(&self.anchor) {
            return Err(self.violation(record_folder));
        }
        self.descend(record_folder, ATTACHMENTS_FOLDER)
    }

    /// Find the record's folder without creating anything.
    pub fn locate_record(&self, record: &Record) -> Result<Option<FolderHandle>> {
        let mut current = FolderHandle::root();
        let date = date_segments(&record.timestamp);
        let base = record_base_name(record);
        let chain = self
            .anchor
            .segments()
            .iter()
            .map(String::as_str)
            .chain(date.iter().map(String::as_str))
            .chain(std::iter::once(base.as_str()));

        for segment in chain {
            if find_child(&self.store, &current, segment, EntryKind::Folder)?.is_none() {
                return Ok(None);
            }
            current = current.child(segment);
        }
        Ok(Some(current))
    }

    /// Look for folders that belong inside the anchor but sit next to it.
    ///
    /// Reports bare years (`2019`) and timestamp-shaped names
    /// (`..._20190102_030405_...`, `2019-01-02 ...`). Never deletes anything.
    pub fn audit_tree(&self) -> Result<AuditReport> {
        let level = self.anchor.parent().unwrap_or_else(FolderHandle::root);
        let anchor_name = self.anchor.name().unwrap_or_default();
        let children = self.store.list_children(&level)?;

        let mut misplaced = Vec::new();
        for child in &children {
            if child.name == anchor_name {
                continue;
            }
            if let Some(pattern) = misplaced_pattern(&child.name) {
                warn!(name = %child.name, ?pattern, "Misplaced entry outside the archive anchor");
                misplaced.push(MisplacedEntry {
                    name: child.name.clone(),
                    kind: child.kind,
                    created_at: child.created_at,
                    pattern,
                });
            }
        }

        Ok(AuditReport {
            anchor: self.anchor.to_string(),
            scanned: children.len(),
            misplaced,
        })
    }

    /// Get or create `name` below `current`, checking what the store returns.
    fn descend(&self, current: &FolderHandle, name: &str) -> Result<FolderHandle> {
        let next = self.store.get_or_create_folder(current, name)?;
        let direct_child = next.parent().as_ref() == Some(current) && next.name() == Some(name);
        let inside = next.is_within(&self.anchor) || self.anchor.is_within(&next);
        if !direct_child || !inside {
            return Err(self.violation(&next));
        }
        Ok(next)
    }

    fn violation(&self, folder: &FolderHandle) -> ArchiveError {
        ArchiveError::PathIntegrityViolation {
            folder: folder.to_string(),
            anchor: self.anchor.to_string(),
        }
    }
}

/// Which naming pattern flagged an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MisplacedPattern {
    BareYear,
    CompactTimestamp,
    IsoDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct MisplacedEntry {
    pub name: String,
    pub kind: EntryKind,
    pub created_at: Option<DateTime<Utc>>,
    pub pattern: MisplacedPattern,
}

/// Result of [`PathResolver::audit_tree`].
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub anchor: String,
    /// Entries looked at, the anchor included.
    pub scanned: usize,
    pub misplaced: Vec<MisplacedEntry>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.misplaced.is_empty()
    }
}

fn misplaced_pattern(name: &str) -> Option<MisplacedPattern> {
    let bytes = name.as_bytes();
    if bytes.len() == 4 && bytes.iter().all(u8::is_ascii_digit) && (bytes[0] == b'1' || bytes[0] == b'2') {
        return Some(MisplacedPattern::BareYear);
    }
    if has_shape(bytes, b"dddddddd_dddddd") {
        return Some(MisplacedPattern::CompactTimestamp);
    }
    if has_shape(bytes, b"dddd-dd-dd") {
        return Some(MisplacedPattern::IsoDate);
    }
    None
}

/// Whether some window of `bytes` matches `shape`, where `d` is any digit
/// and every other byte matches itself.
fn has_shape(bytes: &[u8], shape: &[u8]) -> bool {
    bytes.windows(shape.len()).any(|window| {
        window.iter().zip(shape).all(|(&b, &s)| match s {
            b'd' => b.is_ascii_digit(),
            _ => b == s,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{ChildEntry, MemoryStore};
    use crate::model::record::RawRecord;

    fn record(subject: &str, ts: &str) -> Record {
        Record::ingest(RawRecord {
            id: "<id-1@example.com>".into(),
            timestamp: Some(ts.into()),
            subject: Some(subject.into()),
            ..Default::default()
        })
        .unwrap()
    }

    fn anchor() -> FolderHandle {
        FolderHandle::root().child("Mail Archive")
    }

    #[test]
    fn test_base_name() {
        let r = record("Re: Invoice #42 / March", "2023-03-05T07:08:09Z");
        let base = record_base_name(&r);
        assert!(base.starts_with("Re_Invoice_#42_March_20230305_070809_"), "{base}");
        assert_eq!(base, record_base_name(&r));

        let r = record("   ", "2023-03-05T07:08:09Z");
        assert!(record_base_name(&r).starts_with("untitled_20230305_070809_"));
    }

    #[test]
    fn test_base_name_fits_segment_limit() {
        let r = record(&"🎉".repeat(70), "2023-09-01T10:00:00Z");
        let base = record_base_name(&r);
        assert!(base.starts_with(&format!("{}_20230901_100000_", "🎉".repeat(37))), "{base}");
        assert!(artifact_name(&base, ArtifactKind::Html).len() < 255);

        let r = record(&"x".repeat(200), "2023-09-01T10:00:00Z");
        assert!(record_base_name(&r).starts_with(&format!("{}_2023", "x".repeat(SUBJECT_SEGMENT_LEN))));
    }

    #[test]
    fn test_resolve_record_layout() {
        let store = MemoryStore::new();
        let resolver = PathResolver::new(&store, anchor());
        resolver.ensure_anchor().unwrap();

        let r = record("Hello", "2021-12-31T23:59:59Z");
        let folder = resolver.resolve_record(&r).unwrap();
        let segments = folder.segments();
        assert_eq!(&segments[..4], ["Mail Archive", "2021", "12", "31"]);
        assert!(folder.is_within(&anchor()));

        assert_eq!(resolver.locate_record(&r).unwrap(), Some(folder.clone()));
        assert_eq!(resolver.resolve_record(&r).unwrap(), folder);
    }

    #[test]
    fn test_locate_creates_nothing() {
        let store = MemoryStore::new();
        let resolver = PathResolver::new(&store, anchor());
        let r = record("Hello", "2021-12-31T23:59:59Z");
        assert_eq!(resolver.locate_record(&r).unwrap(), None);
        assert!(store.folders().is_empty());
    }

    #[test]
    fn test_resolve_rejects_parent_outside_anchor() {
        let store = MemoryStore::new();
        let resolver = PathResolver::new(&store, anchor());
        resolver.ensure_anchor().unwrap();
        let outside = store.get_or_create_folder(&FolderHandle::root(), "Other").unwrap();
        let ts = Utc::now();
        let err = resolver.resolve(&outside, &ts).unwrap_err();
        assert!(matches!(err, ArchiveError::PathIntegrityViolation { .. }));
        assert_eq!(store.list_children(&outside).unwrap().len(), 0);
    }

    /// A store that files every new folder under the root.
    struct MisroutingStore(MemoryStore);

    impl DestinationStore for MisroutingStore {
        fn get_or_create_folder(&self, _parent: &FolderHandle, name: &str) -> Result<FolderHandle> {
            self.0.get_or_create_folder(&FolderHandle::root(), name)
        }
        fn list_children(&self, folder: &FolderHandle) -> Result<Vec<ChildEntry>> {
            self.0.list_children(folder)
        }
        fn create_file(&self, folder: &FolderHandle, name: &str, content: &[u8]) -> Result<()> {
            self.0.create_file(folder, name, content)
        }
    }

    #[test]
    fn test_misrouted_folder_stops_resolution() {
        let store = MisroutingStore(MemoryStore::new());
        let resolver = PathResolver::new(&store, anchor());
        resolver.ensure_anchor().unwrap();

        let r = record("Hello", "2021-12-31T23:59:59Z");
        let err = resolver.resolve_record(&r).unwrap_err();
        assert!(matches!(err, ArchiveError::PathIntegrityViolation { .. }));
        // Only the first misrouted folder was created; no month/day below it.
        let names: Vec<String> = store
            .0
            .list_children(&FolderHandle::root())
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["2021", "Mail Archive"]);
        assert!(store.0.list_children(&FolderHandle::root().child("2021")).unwrap().is_empty());
    }

    #[test]
    fn test_misplaced_patterns() {
        assert_eq!(misplaced_pattern("2019"), Some(MisplacedPattern::BareYear));
        assert_eq!(misplaced_pattern("0042"), None);
        assert_eq!(
            misplaced_pattern("Invoice_20190102_030405_ab12cd34"),
            Some(MisplacedPattern::CompactTimestamp)
        );
        assert_eq!(misplaced_pattern("backup 2019-01-02"), Some(MisplacedPattern::IsoDate));
        assert_eq!(misplaced_pattern("Photos"), None);
        assert_eq!(misplaced_pattern("20190102"), None);
    }

    #[test]
    fn test_audit_tree() {
        let store = MemoryStore::new();
        let resolver = PathResolver::new(&store, anchor());
        resolver.ensure_anchor().unwrap();
        let root = FolderHandle::root();
        store.get_or_create_folder(&root, "2019").unwrap();
        store.get_or_create_folder(&root, "Notes").unwrap();
        store.create_file(&root, "Re_x_20200101_000000_deadbeef.html", b"").unwrap();
        resolver.resolve_record(&record("Inside", "2020-01-01T00:00:00Z")).unwrap();

        let report = resolver.audit_tree().unwrap();
        assert_eq!(report.scanned, 4);
        let names: Vec<&str> = report.misplaced.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["2019", "Re_x_20200101_000000_deadbeef.html"]);
        assert_eq!(report.misplaced[0].kind, EntryKind::Folder);
        assert!(report.misplaced[0].created_at.is_some());
        // Audit never deletes.
        assert_eq!(store.list_children(&root).unwrap().len(), 4);
    }
}
