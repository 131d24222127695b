//! Turning untrusted record fields into safe path segments and markup.
//!
//! Every function here is total: any input, including `None`, produces a
//! usable value and nothing can panic.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

/// Characters that are never allowed in a path segment on any platform.
pub const ILLEGAL_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Default maximum length (in characters) of a sanitized name.
pub const MAX_NAME_LEN: usize = 120;

/// Default maximum UTF-8 length of a sanitized name.
///
/// Filesystems cap a path segment at 255 bytes; this leaves room for an
/// ordinal prefix such as `12_`.
pub const MAX_NAME_BYTES: usize = 200;

/// Longest suffix still treated as a file extension.
const MAX_EXTENSION_LEN: usize = 8;

const SEPARATOR: char = '_';

static SYNTHETIC_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sanitize an untrusted name for use as a file or folder name.
///
/// Rules, in order:
/// 1. missing input yields a synthetic unique name
/// 2. illegal and control characters are stripped
/// 3. whitespace runs become a single `_`
/// 4. repeated separators collapse
/// 5. leading/trailing separators and dots are trimmed
/// 6. embedded dots are neutralized, keeping only a short final extension
/// 7. the result is truncated to [`MAX_NAME_LEN`] characters and
///    [`MAX_NAME_BYTES`] bytes on a character boundary, keeping the extension
/// 8. an empty result falls back to a synthetic unique name
///
/// # Examples
/// - `"Q3 report.final.pdf"` → `"Q3_report_final.pdf"`
/// - `"a<b>c"` → `"abc"`
/// - `"???"` → `"file_1718000000000_7"`
pub fn sanitize_name(raw: Option<&str>) -> String {
    match raw {
        Some(raw) => {
            let clean = sanitize_segment(raw, MAX_NAME_LEN, MAX_NAME_BYTES);
            if clean.is_empty() {
                synthetic_name("file")
            } else {
                clean
            }
        }
        None => synthetic_name("file"),
    }
}

/// The deterministic part of [`sanitize_name`]: may return an empty string.
///
/// Used where the same input must always produce the same output, such as
/// record folder names that the existence probe looks up later. The result
/// holds at most `max_chars` characters and `max_bytes` UTF-8 bytes.
pub fn sanitize_segment(raw: &str, max_chars: usize, max_bytes: usize) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for ch in raw.chars() {
        if ILLEGAL_CHARS.contains(&ch) || ch.is_control() && !ch.is_whitespace() {
            continue;
        }
        if ch.is_whitespace() || ch == SEPARATOR {
            pending_separator = true;
            continue;
        }
        if pending_separator {
            out.push(SEPARATOR);
            pending_separator = false;
        }
        out.push(ch);
    }

    let trimmed = trim_separators(&out);
    let neutralized = neutralize_dots(trimmed);
    truncate_name(&neutralized, max_chars, max_bytes)
}

/// Generate a unique name from the current time and a process-wide counter.
pub fn synthetic_name(prefix: &str) -> String {
    let n = SYNTHETIC_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let millis = chrono::Utc::now().timestamp_millis();
    format!("{prefix}_{millis}_{n}")
}

/// Escape text for embedding in HTML.
///
/// Replaces `& < > " '` and `/` with entities. `None` becomes `""`.
pub fn escape_markup<S: AsRef<str>>(raw: Option<S>) -> String {
    let Some(raw) = raw else {
        return String::new();
    };
    let raw = raw.as_ref();
    let mut out = String::with_capacity(raw.len() + raw.len() / 8);
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '/' => out.push_str("&#x2F;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape any displayable value, coercing it to a string first.
pub fn escape_value<T: Display + ?Sized>(value: &T) -> String {
    escape_markup(Some(value.to_string()))
}

/// Exact inverse of [`escape_markup`]. Unknown entities are left untouched.
pub fn unescape_markup(escaped: &str) -> String {
    const ENTITIES: [(&str, char); 6] = [
        ("&amp;", '&'),
        ("&lt;", '<'),
        ("&gt;", '>'),
        ("&quot;", '"'),
        ("&#39;", '\''),
        ("&#x2F;", '/'),
    ];

    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match ENTITIES.iter().find(|(entity, _)| tail.starts_with(entity)) {
            Some((entity, ch)) => {
                out.push(*ch);
                rest = &tail[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn trim_separators(s: &str) -> &str {
    s.trim_matches(|c: char| c == SEPARATOR || c == '.')
}

/// Keep only the final dot, and only when what follows looks like an extension.
fn neutralize_dots(name: &str) -> String {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return name.to_string();
    };
    let is_extension = !stem.is_empty()
        && !ext.is_empty()
        && ext.chars().count() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());

    let joined = if is_extension {
        format!("{}.{ext}", collapse_separators(&stem.replace('.', "_")))
    } else {
        collapse_separators(&name.replace('.', "_"))
    };
    trim_separators(&joined).to_string()
}

fn collapse_separators(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == SEPARATOR && out.ends_with(SEPARATOR) {
            continue;
        }
        out.push(ch);
    }
    out
}

fn truncate_name(name: &str, max_chars: usize, max_bytes: usize) -> String {
    if name.len() <= max_bytes && name.chars().count() <= max_chars {
        return name.to_string();
    }

    if let Some((stem, ext)) = name.rsplit_once('.') {
        let ext_chars = ext.chars().count() + 1;
        let ext_bytes = ext.len() + 1;
        if ext_chars < max_chars && ext_bytes < max_bytes {
            let stem = trim_separators(prefix_within(stem, max_chars - ext_chars, max_bytes - ext_bytes));
            if !stem.is_empty() {
                return format!("{stem}.{ext}");
            }
        }
    }

    trim_separators(prefix_within(name, max_chars, max_bytes)).to_string()
}

/// Longest prefix of `s` within both limits, cut on a character boundary.
fn prefix_within(s: &str, max_chars: usize, max_bytes: usize) -> &str {
    let end = s
        .char_indices()
        .take(max_chars)
        .map(|(idx, ch)| idx + ch.len_utf8())
        .take_while(|&end| end <= max_bytes)
        .last()
        .unwrap_or(0);
    &s[..end]
}
