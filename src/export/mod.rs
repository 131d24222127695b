//! Artifact rendering and writing: HTML, plain text, attachments, and the
//! metadata marker.

pub mod html;
pub mod metadata;
pub mod text;
pub mod writer;

pub use metadata::{ArtifactMetadata, AttachmentEntry, AttachmentStatus};
pub use writer::{ArtifactWriter, SkippedAttachment, WriteReport, WriterConfig};
