//! Persist one record into its folder.
//!
//! Layout of a record folder:
//!
//! ```text
//! <base>/
//!   <base>.html
//!   <base>.txt
//!   attachments/        (only when something survived validation)
//!     1_report.pdf
//!     2_photo.jpg
//!   <base>.json         (written last)
//! ```

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::destination::path::{artifact_name, record_base_name, ArtifactKind, PathResolver};
use crate::destination::{DestinationStore, FolderHandle};
use crate::error::{ArchiveError, Result};
use crate::export::html::render_html;
use crate::export::metadata::{ArtifactMetadata, AttachmentEntry, AttachmentStatus};
use crate::export::text::render_text;
use crate::model::attachment::Attachment;
use crate::model::record::Record;
use crate::sanitize::sanitize_name;

/// Default per-attachment size limit (25 MiB).
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;

/// Attachment policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    pub max_attachment_bytes: u64,
    /// MIME types to keep (`image/*` style wildcards allowed). Empty keeps all.
    pub allowed_types: Vec<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            allowed_types: Vec::new(),
        }
    }
}

/// An attachment that was not stored, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedAttachment {
    pub ordinal: usize,
    pub name: String,
    pub reason: String,
}

/// Outcome of [`ArtifactWriter::write`].
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub folder: FolderHandle,
    /// Files written, relative to the record folder, in write order.
    pub written: Vec<String>,
    pub skipped_attachments: Vec<SkippedAttachment>,
}

/// An attachment that passed validation, with its bytes.
struct Accepted {
    ordinal: usize,
    file_name: String,
    bytes: Vec<u8>,
}

/// Writes the artifacts of a record.
pub struct ArtifactWriter<D: DestinationStore, C: Clock> {
    resolver: PathResolver<D>,
    config: WriterConfig,
    clock: C,
}

impl<D: DestinationStore, C: Clock> ArtifactWriter<D, C> {
    pub fn new(store: D, anchor: FolderHandle, config: WriterConfig, clock: C) -> Self {
        Self {
            resolver: PathResolver::new(store, anchor),
            config,
            clock,
        }
    }

    /// Write `record` into `folder`.
    ///
    /// Fails fast with `InvalidInput` when either argument is missing.
    /// Attachment problems never fail the record; they are reported in
    /// [`WriteReport::skipped_attachments`].
    pub fn write(&self, record: Option<&Record>, folder: Option<&FolderHandle>) -> Result<WriteReport> {
        let record = record.ok_or_else(|| ArchiveError::InvalidInput("no record to write".into()))?;
        let folder = folder.ok_or_else(|| {
            ArchiveError::InvalidInput(format!("no destination folder for record {}", record.id))
        })?;

        let base = record_base_name(record);
        let multiple = record.attachments.len() > 1;
        let mut written = Vec::new();
        let mut skipped = Vec::new();
        let mut entries = Vec::with_capacity(record.attachments.len());
        let mut accepted = Vec::new();

        for (index, slot) in record.attachments.iter().enumerate() {
            let ordinal = index + 1;
            match self.validate(slot.as_ref(), ordinal, multiple) {
                Ok(ok) => {
                    entries.push(entry_for(slot.as_ref(), ordinal, Some(&ok), None));
                    accepted.push(ok);
                }
                Err(reason) => {
                    debug!(record = %record.id, ordinal, %reason, "Attachment skipped");
                    entries.push(entry_for(slot.as_ref(), ordinal, None, Some(reason.clone())));
                    skipped.push(SkippedAttachment {
                        ordinal,
                        name: slot.as_ref().map(|a| a.name.clone()).unwrap_or_default(),
                        reason,
                    });
                }
            }
        }

        // A folder that cannot be created costs the attachments, not the record.
        if !accepted.is_empty() {
            match self.resolver.resolve_attachments(folder) {
                Ok(dir) => {
                    for att in accepted {
                        match self.resolver.store().create_file(&dir, &att.file_name, &att.bytes) {
                            Ok(()) => written.push(format!("{}/{}", dir.name().unwrap_or_default(), att.file_name)),
                            Err(e) => {
                                warn!(record = %record.id, file = %att.file_name, error = %e, "Attachment write failed");
                                mark_skipped(&mut entries, &mut skipped, att, format!("write failed: {e}"));
                            }
                        }
                    }
                }
                Err(e @ ArchiveError::PathIntegrityViolation { .. }) => return Err(e),
                Err(e) => {
                    warn!(record = %record.id, error = %e, "Attachments folder unavailable");
                    let reason = format!("attachments folder unavailable: {e}");
                    for att in accepted {
                        mark_skipped(&mut entries, &mut skipped, att, reason.clone());
                    }
                }
            }
        }

        let store = self.resolver.store();
        let html_name = artifact_name(&base, ArtifactKind::Html);
        store.create_file(folder, &html_name, render_html(record, &entries).as_bytes())?;
        written.push(html_name);

        let text_name = artifact_name(&base, ArtifactKind::Text);
        store.create_file(folder, &text_name, render_text(record, &entries).as_bytes())?;
        written.push(text_name);

        let archived_at: DateTime<Utc> = self.clock.now();
        let metadata = ArtifactMetadata::new(record, entries, archived_at);
        let meta_name = artifact_name(&base, ArtifactKind::Metadata);
        store.create_file(folder, &meta_name, &metadata.to_json()?)?;
        written.push(meta_name);

        debug!(
            record = %record.id,
            folder = %folder,
            files = written.len(),
            skipped = skipped.len(),
            "Wrote record artifacts"
        );
        Ok(WriteReport {
            folder: folder.clone(),
            written,
            skipped_attachments: skipped,
        })
    }

    /// Apply the attachment policy to one slot. `Err` carries the skip reason.
    fn validate(&self, slot: Option<&Attachment>, ordinal: usize, prefix: bool) -> std::result::Result<Accepted, String> {
        let att = slot.ok_or("attachment missing from record")?;
        let content = att.content.as_ref().ok_or("attachment has no content")?;
        let max = self.config.max_attachment_bytes;

        if att.declared_size > max {
            return Err(format!("declared size {} exceeds limit of {max} bytes", att.declared_size));
        }
        if !att.type_allowed(&self.config.allowed_types) {
            return Err(format!("type {} is not allowed", att.mime_type));
        }

        let bytes = content
            .materialize()
            .map_err(|e| format!("content unreadable: {e}"))?;
        if bytes.is_empty() {
            return Err("attachment is empty".to_string());
        }
        if bytes.len() as u64 > max {
            return Err(format!("size {} exceeds limit of {max} bytes", bytes.len()));
        }

        let name = sanitize_name(Some(&att.name));
        let file_name = if prefix { format!("{ordinal}_{name}") } else { name };
        Ok(Accepted {
            ordinal,
            file_name,
            bytes,
        })
    }
}

/// Turn an accepted attachment into a skipped one after a storage failure.
fn mark_skipped(
    entries: &mut [AttachmentEntry],
    skipped: &mut Vec<SkippedAttachment>,
    att: Accepted,
    reason: String,
) {
    if let Some(entry) = entries.iter_mut().find(|e| e.ordinal == att.ordinal) {
        entry.status = AttachmentStatus::Skipped;
        entry.stored_as = None;
        entry.reason = Some(reason.clone());
    }
    skipped.push(SkippedAttachment {
        ordinal: att.ordinal,
        name: att.file_name,
        reason,
    });
}

fn entry_for(
    slot: Option<&Attachment>,
    ordinal: usize,
    accepted: Option<&Accepted>,
    reason: Option<String>,
) -> AttachmentEntry {
    AttachmentEntry {
        ordinal,
        original_name: slot.map(|a| a.name.clone()).unwrap_or_default(),
        stored_as: accepted.map(|a| a.file_name.clone()),
        mime_type: slot.map(|a| a.mime_type.clone()).unwrap_or_default(),
        size_bytes: match accepted {
            Some(a) => a.bytes.len() as u64,
            None => slot.map(|a| a.declared_size).unwrap_or(0),
        },
        status: if accepted.is_some() {
            AttachmentStatus::Stored
        } else {
            AttachmentStatus::Skipped
        },
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::destination::path::ATTACHMENTS_FOLDER;
    use crate::destination::MemoryStore;
    use crate::model::attachment::{AttachmentBody, RawAttachment};
    use crate::model::record::RawRecord;

    fn clock() -> ManualClock {
        ManualClock::new(Utc::now())
    }

    fn att(name: &str, mime: &str, bytes: &[u8]) -> Option<RawAttachment> {
        Some(RawAttachment {
            name: Some(name.into()),
            mime_type: Some(mime.into()),
            size_bytes: Some(bytes.len() as u64),
            content: Some(AttachmentBody::Inline(bytes.to_vec())),
        })
    }

    fn record(attachments: Vec<Option<RawAttachment>>) -> Record {
        Record::ingest(RawRecord {
            id: "w1".into(),
            timestamp: Some("2023-04-05T06:07:08Z".into()),
            subject: Some("Writer test".into()),
            text_body: Some("body".into()),
            attachments,
            ..Default::default()
        })
        .unwrap()
    }

    fn setup(store: &MemoryStore, r: &Record) -> FolderHandle {
        let resolver = PathResolver::new(store, FolderHandle::root().child("A"));
        resolver.ensure_anchor().unwrap();
        resolver.resolve_record(r).unwrap()
    }

    #[test]
    fn test_missing_arguments_fail_fast() {
        let store = MemoryStore::new();
        let c = clock();
        let writer = ArtifactWriter::new(&store, FolderHandle::root().child("A"), WriterConfig::default(), &c);
        let r = record(vec![]);
        assert!(matches!(writer.write(None, None), Err(ArchiveError::InvalidInput(_))));
        assert!(matches!(writer.write(Some(&r), None), Err(ArchiveError::InvalidInput(_))));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_writes_bodies_and_metadata_last() {
        let store = MemoryStore::new();
        let c = clock();
        let r = record(vec![att("report.pdf", "application/pdf", b"%PDF")]);
        let folder = setup(&store, &r);
        let writer = ArtifactWriter::new(&store, FolderHandle::root().child("A"), WriterConfig::default(), &c);

        let report = writer.write(Some(&r), Some(&folder)).unwrap();
        let base = record_base_name(&r);
        assert_eq!(report.written.len(), 4);
        assert_eq!(report.written[0], "attachments/report.pdf");
        assert_eq!(report.written.last().unwrap(), &format!("{base}.json"));

        let attachments = folder.child(ATTACHMENTS_FOLDER);
        assert_eq!(store.read_file(&attachments, "report.pdf").unwrap(), b"%PDF");
        let meta = ArtifactMetadata::from_json(&store.read_file(&folder, &format!("{base}.json")).unwrap()).unwrap();
        assert_eq!(meta.stored_count(), 1);
    }

    #[test]
    fn test_attachment_policy() {
        let store = MemoryStore::new();
        let c = clock();
        let r = record(vec![
            att("a.pdf", "application/pdf", b"pdf"),
            None,
            att("huge.bin", "application/octet-stream", &[1u8; 64]),
            att("empty.txt", "text/plain", b""),
            att("run.exe", "application/x-msdownload", b"MZ"),
            att("photo.jpg", "image/jpeg", b"jpg"),
            Some(RawAttachment {
                name: Some("broken.png".into()),
                mime_type: Some("image/png".into()),
                size_bytes: None,
                content: Some(AttachmentBody::deferred(|| {
                    Err(ArchiveError::Source("gone".into()))
                })),
            }),
        ]);
        let folder = setup(&store, &r);
        let config = WriterConfig {
            max_attachment_bytes: 32,
            allowed_types: vec!["application/pdf".into(), "image/*".into(), "text/plain".into(), "application/octet-stream".into()],
        };
        let writer = ArtifactWriter::new(&store, FolderHandle::root().child("A"), config, &c);
        let report = writer.write(Some(&r), Some(&folder)).unwrap();

        let skipped: Vec<usize> = report.skipped_attachments.iter().map(|s| s.ordinal).collect();
        assert_eq!(skipped, [2, 3, 4, 5, 7]);
        let attachments = folder.child(ATTACHMENTS_FOLDER);
        assert!(store.read_file(&attachments, "1_a.pdf").is_some());
        assert!(store.read_file(&attachments, "6_photo.jpg").is_some());
        assert!(store.read_file(&attachments, "3_huge.bin").is_none());
    }

    #[test]
    fn test_no_attachments_folder_when_nothing_survives() {
        let store = MemoryStore::new();
        let c = clock();
        let r = record(vec![att("empty.txt", "text/plain", b"")]);
        let folder = setup(&store, &r);
        let writer = ArtifactWriter::new(&store, FolderHandle::root().child("A"), WriterConfig::default(), &c);
        let report = writer.write(Some(&r), Some(&folder)).unwrap();
        assert_eq!(report.skipped_attachments.len(), 1);
        assert!(!store.folder_exists(&folder.child(ATTACHMENTS_FOLDER)));
    }

    #[test]
    fn test_failed_attachment_write_is_contained() {
        let store = MemoryStore::new();
        store.fail_writes_to("1_a.pdf");
        let c = clock();
        let r = record(vec![att("a.pdf", "application/pdf", b"a"), att("b.pdf", "application/pdf", b"b")]);
        let folder = setup(&store, &r);
        let writer = ArtifactWriter::new(&store, FolderHandle::root().child("A"), WriterConfig::default(), &c);
        let report = writer.write(Some(&r), Some(&folder)).unwrap();

        assert_eq!(report.skipped_attachments.len(), 1);
        assert!(report.skipped_attachments[0].reason.starts_with("write failed"));
        assert!(store.read_file(&folder.child(ATTACHMENTS_FOLDER), "2_b.pdf").is_some());
        let base = record_base_name(&r);
        let meta = ArtifactMetadata::from_json(&store.read_file(&folder, &format!("{base}.json")).unwrap()).unwrap();
        assert_eq!(meta.attachments[0].status, AttachmentStatus::Skipped);
        assert_eq!(meta.attachments[1].status, AttachmentStatus::Stored);
    }

    #[test]
    fn test_unusable_attachments_folder_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::destination::FsStore::open(dir.path()).unwrap();
        let c = clock();
        let r = record(vec![att("a.pdf", "application/pdf", b"a"), att("b.pdf", "application/pdf", b"b")]);
        let resolver = PathResolver::new(&store, FolderHandle::root().child("A"));
        resolver.ensure_anchor().unwrap();
        let folder = resolver.resolve_record(&r).unwrap();
        // A plain file where the attachments folder should go.
        std::fs::write(store.path_of(&folder).join(ATTACHMENTS_FOLDER), b"in the way").unwrap();

        let writer = ArtifactWriter::new(&store, FolderHandle::root().child("A"), WriterConfig::default(), &c);
        let report = writer.write(Some(&r), Some(&folder)).unwrap();

        assert_eq!(report.skipped_attachments.len(), 2);
        assert!(report
            .skipped_attachments
            .iter()
            .all(|s| s.reason.starts_with("attachments folder unavailable")));
        let base = record_base_name(&r);
        assert_eq!(report.written, [format!("{base}.html"), format!("{base}.txt"), format!("{base}.json")]);
        let meta_path = store.path_of(&folder).join(format!("{base}.json"));
        let meta = ArtifactMetadata::from_json(&std::fs::read(meta_path).unwrap()).unwrap();
        assert_eq!(meta.stored_count(), 0);
        assert!(meta.attachments.iter().all(|a| a.status == AttachmentStatus::Skipped));
    }
}
