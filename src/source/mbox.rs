//! MBOX files as a record source.
//!
//! The file is scanned once at open time, line by line with a large buffer,
//! keeping only each message's offset, length, and the header fields a query
//! needs. Bodies and attachments are read back with a seek when a search
//! returns the message, and attachment bytes only when the writer asks.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::FetchService;
use crate::error::{ArchiveError, Result};
use crate::model::attachment::{AttachmentBody, RawAttachment};
use crate::model::record::{parse_timestamp, RawRecord};
use crate::schedule::{Candidate, ScopedQuery};

/// Size of the internal read buffer.
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// One message as indexed at open time.
#[derive(Debug, Clone)]
struct CatalogEntry {
    offset: u64,
    length: u64,
    id: String,
    thread_id: Option<String>,
    /// `Date:` header, or the date on the `From ` line when there is none.
    date_raw: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    subject: String,
    from: String,
    to: String,
    cc: String,
    labels: Vec<String>,
    has_attachments: bool,
}

impl CatalogEntry {
    fn candidate(&self) -> Candidate<'_> {
        Candidate {
            timestamp: self.timestamp,
            subject: &self.subject,
            from: &self.from,
            to: &self.to,
            labels: &self.labels,
            has_attachments: self.has_attachments,
        }
    }
}

/// Read-only record source over a single MBOX file.
///
/// Records come back oldest first; messages whose date cannot be read are
/// listed last so that the engine can report them.
#[derive(Debug)]
pub struct MboxSource {
    path: Arc<PathBuf>,
    catalog: Vec<CatalogEntry>,
}

impl MboxSource {
    /// Scan `path` and build the message catalog.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut catalog = Vec::new();

        let count = scan_headers(&path, &mut |offset, length, headers| {
            catalog.push(catalog_entry(offset, length, headers));
        })?;

        catalog.sort_by_key(|e| (e.timestamp.is_none(), e.timestamp));
        let undated = catalog.iter().filter(|e| e.timestamp.is_none()).count();
        info!(
            path = %path.display(),
            messages = count,
            undated,
            "Indexed MBOX"
        );

        Ok(Self {
            path: Arc::new(path),
            catalog,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of messages in the file.
    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    fn load_record(&self, entry: &CatalogEntry) -> Result<RawRecord> {
        let raw = read_message_at(&self.path, entry.offset, entry.length)?;
        let message = skip_from_line(&raw);

        let mut record = RawRecord {
            id: entry.id.clone(),
            thread_id: entry.thread_id.clone(),
            timestamp: entry.date_raw.clone(),
            subject: Some(entry.subject.clone()),
            from: Some(entry.from.clone()),
            to: Some(entry.to.clone()),
            cc: Some(entry.cc.clone()),
            labels: entry.labels.clone(),
            ..Default::default()
        };

        let Some(parsed) = MessageParser::default().parse(message) else {
            warn!(id = %entry.id, offset = entry.offset, "Message body could not be parsed");
            return Ok(record);
        };

        record.html_body = parsed.body_html(0).map(|s| s.into_owned());
        record.text_body = parsed.body_text(0).map(|s| s.into_owned());

        for (index, part) in parsed.attachments().enumerate() {
            let mime_type = part.content_type().map(|ct: &mail_parser::ContentType| {
                match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                }
            });
            let path = Arc::clone(&self.path);
            let (offset, length) = (entry.offset, entry.length);
            record.attachments.push(Some(RawAttachment {
                name: part.attachment_name().map(String::from),
                mime_type,
                size_bytes: Some(part.contents().len() as u64),
                content: Some(AttachmentBody::deferred(move || {
                    attachment_bytes(&path, offset, length, index)
                })),
            }));
        }

        Ok(record)
    }
}

impl FetchService for MboxSource {
    fn search(&self, query: &ScopedQuery, offset: usize, limit: usize) -> Result<Vec<RawRecord>> {
        let hits: Vec<&CatalogEntry> = self
            .catalog
            .iter()
            .filter(|e| query.matches(&e.candidate()))
            .skip(offset)
            .take(limit)
            .collect();
        debug!(query = %query, offset, hits = hits.len(), "Searched MBOX catalog");

        hits.into_iter().map(|e| self.load_record(e)).collect()
    }
}

/// Re-read a message and return the decoded bytes of its `index`th attachment.
fn attachment_bytes(path: &Path, offset: u64, length: u64, index: usize) -> Result<Vec<u8>> {
    let raw = read_message_at(path, offset, length)?;
    let parsed = MessageParser::default()
        .parse(skip_from_line(&raw))
        .ok_or_else(|| ArchiveError::Source(format!("message at offset {offset} no longer parses")))?;
    parsed
        .attachments()
        .nth(index)
        .map(|part| part.contents().to_vec())
        .ok_or_else(|| {
            ArchiveError::Source(format!("attachment {index} missing from message at offset {offset}"))
        })
}

fn catalog_entry(offset: u64, length: u64, header_bytes: &[u8]) -> CatalogEntry {
    let from_line_date = from_line_date(header_bytes);
    let text = String::from_utf8_lossy(skip_from_line(header_bytes));
    let headers = unfold_headers(&text);

    let date_raw = get_header(&headers, "date").or(from_line_date);
    let timestamp = date_raw.as_deref().and_then(parse_timestamp);

    let id = get_header(&headers, "message-id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            let mut hasher = Sha256::new();
            hasher.update(header_bytes);
            let hex = format!("{:x}", hasher.finalize());
            format!("mbox:{}", &hex[..16])
        });

    let content_type = get_header(&headers, "content-type")
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_lowercase())
        .unwrap_or_default();
    let has_attachments = content_type.starts_with("multipart/mixed")
        || headers
            .iter()
            .any(|(k, v)| k == "content-disposition" && v.to_lowercase().contains("attachment"));

    let labels = get_header(&headers, "x-gmail-labels")
        .map(|s| {
            decode_words(&s)
                .split(',')
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let decoded = |name: &str| {
        get_header(&headers, name)
            .map(|v| decode_words(&v))
            .unwrap_or_default()
    };

    CatalogEntry {
        offset,
        length,
        id,
        thread_id: get_header(&headers, "x-gm-thrid"),
        date_raw,
        timestamp,
        subject: decoded("subject"),
        from: decoded("from"),
        to: decoded("to"),
        cc: decoded("cc"),
        labels,
        has_attachments,
    }
}

/// Walk the file and report `(offset, message_length, header_bytes)` for
/// every message. `header_bytes` includes the `From ` line.
fn scan_headers(path: &Path, callback: &mut dyn FnMut(u64, u64, &[u8])) -> Result<u64> {
    let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

    let mut count: u64 = 0;
    let mut current_offset: u64 = 0;
    let mut header_buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut in_headers = false;
    let mut prev_line_was_empty = true;
    let mut first_line = true;
    let mut message_start: Option<u64> = None;
    let mut finished_headers: Option<Vec<u8>> = None;
    let mut line_buf: Vec<u8> = Vec::with_capacity(4096);

    loop {
        line_buf.clear();
        let line_len = {
            let buf = reader.fill_buf().map_err(|e| ArchiveError::io(path, e))?;
            if buf.is_empty() {
                break;
            }
            let consume_len = match memchr_newline(buf) {
                Some(pos) => pos + 1,
                None => buf.len(),
            };
            line_buf.extend_from_slice(&buf[..consume_len]);
            reader.consume(consume_len);
            consume_len as u64
        };

        if is_mbox_separator(&line_buf) {
            if !first_line && !prev_line_was_empty {
                warn!(
                    offset = current_offset,
                    "Found 'From ' separator without preceding blank line"
                );
            }
            if let Some(start) = message_start {
                let headers = finished_headers.take().unwrap_or_else(|| header_buf.clone());
                callback(start, current_offset - start, &headers);
                count += 1;
            }
            header_buf.clear();
            header_buf.extend_from_slice(&line_buf);
            in_headers = true;
            message_start = Some(current_offset);
        } else if in_headers {
            if is_blank_line(&line_buf) {
                in_headers = false;
                finished_headers = Some(std::mem::take(&mut header_buf));
            } else {
                header_buf.extend_from_slice(&line_buf);
            }
        }

        prev_line_was_empty = is_blank_line(&line_buf);
        first_line = false;
        current_offset += line_len;
    }

    if let Some(start) = message_start {
        let headers = finished_headers.unwrap_or(header_buf);
        callback(start, current_offset - start, &headers);
        count += 1;
    }

    Ok(count)
}

/// Read a single message by seeking straight to it.
fn read_message_at(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| ArchiveError::io(path, e))?;
    let mut buffer = vec![0u8; length as usize];
    file.read_exact(&mut buffer)
        .map_err(|e| ArchiveError::io(path, e))?;
    Ok(buffer)
}

#[inline]
fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data)
}

/// Check whether a line is an MBOX separator (`From ` at the start).
fn is_mbox_separator(line: &[u8]) -> bool {
    strip_bom(line).starts_with(b"From ")
}

fn is_blank_line(line: &[u8]) -> bool {
    line.iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
}

/// Drop the leading `From ` separator line.
fn skip_from_line(data: &[u8]) -> &[u8] {
    let data = strip_bom(data);
    if !data.starts_with(b"From ") {
        return data;
    }
    match memchr_newline(data) {
        Some(pos) => &data[pos + 1..],
        None => &[],
    }
}

/// The asctime date on a `From sender Thu Jan  1 00:00:00 2024` line.
fn from_line_date(data: &[u8]) -> Option<String> {
    let data = strip_bom(data);
    let line = data.strip_prefix(b"From ")?;
    let end = memchr_newline(line).unwrap_or(line.len());
    let text = String::from_utf8_lossy(&line[..end]);
    let date: Vec<&str> = text.split_whitespace().skip(1).collect();
    (!date.is_empty()).then(|| date.join(" "))
}

/// Join folded continuation lines. Returns `(lowercase_name, value)` pairs.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
    }

    result
}

fn get_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

/// Decode RFC 2047 encoded-words by letting `mail-parser` read the value as
/// a subject line. Values without encoded-words are returned unchanged.
fn decode_words(raw: &str) -> String {
    if !raw.contains("=?") {
        return raw.to_string();
    }
    let fake_msg = format!("Subject: {raw}\n\n");
    MessageParser::default()
        .parse(fake_msg.as_bytes())
        .and_then(|m| m.subject().map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}
