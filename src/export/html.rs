//! HTML rendering of an archived record, and the reverse trip to plain text.

use crate::export::metadata::{AttachmentEntry, AttachmentStatus};
use crate::model::record::Record;
use crate::sanitize::{escape_markup, escape_value};

/// Render the record as a standalone HTML document.
///
/// Every header value is escaped. The record's own HTML body is embedded as
/// is; without one, the escaped text body is wrapped in `<pre>`.
pub fn render_html(record: &Record, attachments: &[AttachmentEntry]) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    out.push_str(&format!("<title>{}</title>\n", escape_markup(Some(&record.subject))));
    out.push_str("</head>\n<body>\n<table class=\"headers\">\n");

    let date = record.timestamp.format("%a, %d %b %Y %H:%M:%S %z");
    header_row(&mut out, "Date", &escape_value(&date));
    header_row(&mut out, "From", &escape_markup(Some(&record.from)));
    if !record.to.is_empty() {
        header_row(&mut out, "To", &escape_markup(Some(&record.to)));
    }
    if !record.cc.is_empty() {
        header_row(&mut out, "Cc", &escape_markup(Some(&record.cc)));
    }
    header_row(&mut out, "Subject", &escape_markup(Some(&record.subject)));
    if !record.labels.is_empty() {
        let labels: Vec<&str> = record.labels.iter().map(String::as_str).collect();
        header_row(&mut out, "Labels", &escape_markup(Some(labels.join(", "))));
    }
    out.push_str("</table>\n<hr>\n");

    match (&record.html_body, &record.text_body) {
        (Some(html), _) => out.push_str(html),
        (None, Some(text)) => {
            out.push_str("<pre>");
            out.push_str(&escape_markup(Some(text)));
            out.push_str("</pre>");
        }
        (None, None) => {}
    }
    out.push('\n');

    let stored: Vec<&AttachmentEntry> = attachments
        .iter()
        .filter(|a| a.status == AttachmentStatus::Stored)
        .collect();
    if !stored.is_empty() {
        out.push_str("<hr>\n<ul class=\"attachments\">\n");
        for att in stored {
            let name = att.stored_as.as_deref().unwrap_or_default();
            out.push_str(&format!(
                "<li><a href=\"attachments/{0}\">{0}</a> ({1})</li>\n",
                escape_markup(Some(name)),
                escape_markup(Some(&att.mime_type)),
            ));
        }
        out.push_str("</ul>\n");
    }

    out.push_str("</body>\n</html>\n");
    out
}

fn header_row(out: &mut String, label: &str, escaped_value: &str) {
    out.push_str(&format!("<tr><th>{label}</th><td>{escaped_value}</td></tr>\n"));
}

/// Convert HTML to readable plain text.
///
/// - Line breaks from `<br>`, `<p>`, `<div>` and friends
/// - Scripts and styles removed
/// - Common entities decoded
pub fn html_to_text(html: &str) -> String {
    let mut text = remove_tag_block(html, "script");
    text = remove_tag_block(&text, "style");

    for tag in &["br", "BR", "br/", "br /"] {
        text = text.replace(&format!("<{tag}>"), "\n");
    }
    for tag in &["p", "div", "tr", "li", "h1", "h2", "h3", "h4", "h5", "h6"] {
        text = text.replace(&format!("<{tag}>"), "\n");
        text = text.replace(&format!("<{tag} "), "\n<");
        let upper = tag.to_uppercase();
        text = text.replace(&format!("<{upper}>"), "\n");
        text = text.replace(&format!("</{tag}>"), "\n");
        text = text.replace(&format!("</{upper}>"), "\n");
    }

    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    result = result.replace("&nbsp;", " ");
    result = result.replace("&#160;", " ");
    result = result.replace("&apos;", "'");
    let result = crate::sanitize::unescape_markup(&result);

    // At most one blank line in a row
    let mut prev_was_blank = false;
    let mut cleaned = String::with_capacity(result.len());
    for line in result.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !prev_was_blank {
                cleaned.push('\n');
                prev_was_blank = true;
            }
        } else {
            cleaned.push_str(trimmed);
            cleaned.push('\n');
            prev_was_blank = false;
        }
    }

    cleaned.trim().to_string()
}

/// Remove an entire tag block (`<script>…</script>`), case-insensitively.
fn remove_tag_block(html: &str, tag: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    // ASCII lowering keeps byte offsets aligned with the original.
    let lower = html.to_ascii_lowercase();
    let mut pos = 0;

    while let Some(start) = lower[pos..].find(&open).map(|i| pos + i) {
        result.push_str(&html[pos..start]);
        match lower[start..].find(&close) {
            Some(end) => pos = start + end + close.len(),
            None => return result,
        }
    }
    result.push_str(&html[pos..]);
    result
}
