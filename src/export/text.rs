//! Plain-text rendering of an archived record.

use crate::export::html::html_to_text;
use crate::export::metadata::{AttachmentEntry, AttachmentStatus};
use crate::model::record::Record;

/// Render headers, body, and the attachment list as plain text.
///
/// The body is the text part, or the HTML part with its tags stripped.
pub fn render_text(record: &Record, attachments: &[AttachmentEntry]) -> String {
    let mut content = String::new();

    content.push_str(&format!(
        "Date:    {}\n",
        record.timestamp.format("%a, %d %b %Y %H:%M:%S %z")
    ));
    content.push_str(&format!("From:    {}\n", record.from));
    if !record.to.is_empty() {
        content.push_str(&format!("To:      {}\n", record.to));
    }
    if !record.cc.is_empty() {
        content.push_str(&format!("Cc:      {}\n", record.cc));
    }
    content.push_str(&format!("Subject: {}\n", record.subject));
    if !record.labels.is_empty() {
        let labels: Vec<&str> = record.labels.iter().map(String::as_str).collect();
        content.push_str(&format!("Labels:  {}\n", labels.join(", ")));
    }
    content.push_str(&format!("\n{}\n", "-".repeat(72)));

    let body = match (&record.text_body, &record.html_body) {
        (Some(text), _) => Some(text.clone()),
        (None, Some(html)) => Some(html_to_text(html)),
        (None, None) => None,
    };
    if let Some(body) = body {
        content.push('\n');
        content.push_str(&body);
        content.push('\n');
    }

    if !attachments.is_empty() {
        content.push_str(&format!("\n[Attachments: {} file(s)]\n", attachments.len()));
        for att in attachments {
            let size = humansize::format_size(att.size_bytes, humansize::BINARY);
            match att.status {
                AttachmentStatus::Stored => content.push_str(&format!(
                    "  - {} ({}, {})\n",
                    att.stored_as.as_deref().unwrap_or(&att.original_name),
                    att.mime_type,
                    size
                )),
                AttachmentStatus::Skipped => content.push_str(&format!(
                    "  - #{} {} skipped: {}\n",
                    att.ordinal,
                    att.original_name,
                    att.reason.as_deref().unwrap_or("unknown reason")
                )),
            }
        }
    }

    content
}
