//! The per-record metadata document (`{base}.json`).
//!
//! Written after every other artifact of the record, so its presence is
//! what marks a record folder as complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::record::Record;

/// Bumped when the document layout changes incompatibly.
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    Stored,
    Skipped,
}

/// What happened to one attachment slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentEntry {
    /// 1-based position in the record's attachment list.
    pub ordinal: usize,
    /// Name as the source reported it (may be empty).
    pub original_name: String,
    /// Name inside the `attachments` folder, when stored.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stored_as: Option<String>,
    pub mime_type: String,
    pub size_bytes: u64,
    pub status: AttachmentStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub version: u32,
    pub id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub cc: String,
    /// Sorted.
    pub labels: Vec<String>,
    pub has_html: bool,
    pub has_text: bool,
    pub attachments: Vec<AttachmentEntry>,
    pub archived_at: DateTime<Utc>,
}

impl ArtifactMetadata {
    pub fn new(record: &Record, attachments: Vec<AttachmentEntry>, archived_at: DateTime<Utc>) -> Self {
        Self {
            version: METADATA_VERSION,
            id: record.id.clone(),
            thread_id: record.thread_id.clone(),
            subject: record.subject.clone(),
            timestamp: record.timestamp,
            from: record.from.clone(),
            to: record.to.clone(),
            cc: record.cc.clone(),
            labels: record.labels.iter().cloned().collect(),
            has_html: record.html_body.is_some(),
            has_text: record.text_body.is_some(),
            attachments,
            archived_at,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn stored_count(&self) -> usize {
        self.attachments
            .iter()
            .filter(|a| a.status == AttachmentStatus::Stored)
            .count()
    }
}
