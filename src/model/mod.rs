//! Core data model: records and their attachments.

pub mod attachment;
pub mod record;

pub use attachment::{Attachment, AttachmentBody, RawAttachment};
pub use record::{RawRecord, Record};
