//! Attachment types.
//!
//! The binary payload is NOT loaded until the artifact writer needs it.
//! Sources hand over either the bytes or a loader that produces them.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Fallback MIME type when the source does not provide one.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Loader for deferred attachment content.
pub type ContentLoader = Arc<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;

/// Opaque attachment content, materialized on demand.
#[derive(Clone)]
pub enum AttachmentBody {
    /// Content already in memory.
    Inline(Vec<u8>),
    /// Content produced by a loader the first time it is needed.
    Deferred(ContentLoader),
}

impl AttachmentBody {
    /// Wrap a loader closure.
    pub fn deferred<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        Self::Deferred(Arc::new(loader))
    }

    /// Produce the content bytes. Deferred loaders may fail.
    pub fn materialize(&self) -> Result<Vec<u8>> {
        match self {
            Self::Inline(bytes) => Ok(bytes.clone()),
            Self::Deferred(loader) => loader(),
        }
    }
}

impl fmt::Debug for AttachmentBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// An attachment exactly as a fetch service reported it.
#[derive(Debug, Clone, Default)]
pub struct RawAttachment {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    /// Size reported by the source. May be missing, zero, or wrong.
    pub size_bytes: Option<u64>,
    pub content: Option<AttachmentBody>,
}

/// An attachment after ingestion: every field defaulted exactly once.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Untrusted name; may be empty. Sanitized at write time.
    pub name: String,
    /// Lower-cased MIME type (`"image/jpeg"`, `"application/pdf"`).
    pub mime_type: String,
    /// Declared size in bytes, `0` when unknown.
    pub declared_size: u64,
    pub content: Option<AttachmentBody>,
}

impl From<RawAttachment> for Attachment {
    fn from(raw: RawAttachment) -> Self {
        let mime_type = raw
            .mime_type
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
        Self {
            name: raw.name.map(|n| n.trim().to_string()).unwrap_or_default(),
            mime_type,
            declared_size: raw.size_bytes.unwrap_or(0),
            content: raw.content,
        }
    }
}

impl Attachment {
    /// Check the MIME type against an allow-list.
    ///
    /// An empty list disables filtering. Entries ending in `/*` match a whole
    /// top-level type (`image/*`).
    pub fn type_allowed(&self, allowed: &[String]) -> bool {
        if allowed.is_empty() {
            return true;
        }
        allowed.iter().any(|pattern| {
            let pattern = pattern.trim().to_lowercase();
            match pattern.strip_suffix("/*") {
                Some(top) => self
                    .mime_type
                    .split('/')
                    .next()
                    .is_some_and(|t| t == top),
                None => pattern == self.mime_type,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArchiveError;

    #[test]
    fn test_defaults_applied_once() {
        let att = Attachment::from(RawAttachment::default());
        assert_eq!(att.name, "");
        assert_eq!(att.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(att.declared_size, 0);
        assert!(att.content.is_none());
    }

    #[test]
    fn test_mime_type_normalized() {
        let att = Attachment::from(RawAttachment {
            mime_type: Some(" Image/PNG ".into()),
            ..Default::default()
        });
        assert_eq!(att.mime_type, "image/png");
    }

    #[test]
    fn test_type_allowed() {
        let att = Attachment::from(RawAttachment {
            mime_type: Some("image/jpeg".into()),
            ..Default::default()
        });
        assert!(att.type_allowed(&[]));
        assert!(att.type_allowed(&["image/*".to_string()]));
        assert!(att.type_allowed(&["application/pdf".into(), "image/jpeg".into()]));
        assert!(!att.type_allowed(&["application/pdf".to_string()]));
    }

    #[test]
    fn test_deferred_materialize() {
        let ok = AttachmentBody::deferred(|| Ok(vec![1, 2, 3]));
        assert_eq!(ok.materialize().unwrap(), vec![1, 2, 3]);

        let broken = AttachmentBody::deferred(|| Err(ArchiveError::Source("gone".into())));
        assert!(broken.materialize().is_err());
    }
}
