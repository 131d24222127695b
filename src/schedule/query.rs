//! Scoped search queries handed to fetch services.
//!
//! A [`ScopedQuery`] combines the caller's base query with the run's
//! [`Window`]. Mail providers search only the inbox-ish default view unless
//! told otherwise, so the query always carries an explicit scope: the
//! caller's own `in:` qualifier if there is one, otherwise `in:anywhere`.
//!
//! # Base query syntax
//!
//! - `from:alice@example.com`, `to:…`, `subject:…`, `label:work`
//! - `in:inbox`, `in:sent`, `in:anywhere` (scope)
//! - `-in:spam` excludes a location; the scope is still widened
//! - `has:attachment` / `-has:attachment`
//! - `-term` negates, `"quoted phrase"` matches exactly, bare words search
//!   subject and participants
//!
//! Age qualifiers (`older_than:`, `newer_than:`) come from the window and
//! are dropped from the base query.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use super::window::Window;

/// Scope qualifier the engine adds when the caller did not choose one.
pub const ANYWHERE: &str = "anywhere";

/// Which field a term targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryField {
    /// Subject, sender, and recipients.
    All,
    From,
    To,
    Subject,
    Label,
}

/// A single text term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryTerm {
    pub field: QueryField,
    /// Lower-cased needle.
    pub value: String,
    pub exact: bool,
    pub negated: bool,
}

/// Where to look.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Scope {
    /// Widened by the engine: every location.
    Anywhere,
    /// The caller's own `in:` qualifier (lower-cased value).
    Caller(String),
}

/// The fields of a candidate record a query can look at.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// `None` when the source could not read a timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    pub subject: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    pub labels: &'a [String],
    pub has_attachments: bool,
}

/// Base query + window + scope, ready for a fetch service.
#[derive(Debug, Clone, Serialize)]
pub struct ScopedQuery {
    base: String,
    pub terms: Vec<QueryTerm>,
    pub scope: Scope,
    /// Locations from negated `in:` qualifiers (lower-cased).
    pub excluded: Vec<String>,
    pub has_attachment: Option<bool>,
    pub window: Window,
    /// Instant the window's ages are measured from.
    pub reference: DateTime<Utc>,
}

impl ScopedQuery {
    /// Build the query for `window`, measured from `reference`.
    pub fn new(base: &str, window: &Window, reference: DateTime<Utc>) -> Self {
        let mut terms = Vec::new();
        let mut scope = None;
        let mut excluded = Vec::new();
        let mut has_attachment = None;
        let mut kept = Vec::new();

        for token in tokenize(base) {
            let (negated, body) = match token.strip_prefix('-') {
                Some(rest) if !rest.is_empty() => (true, rest),
                _ => (false, token.as_str()),
            };
            let lower = body.to_lowercase();

            if lower.starts_with("older_than:") || lower.starts_with("newer_than:") {
                warn!(token = %token, "Age qualifiers come from the window; ignoring");
                continue;
            }
            kept.push(token.clone());

            if let Some(value) = lower.strip_prefix("in:") {
                if negated {
                    excluded.push(value.to_string());
                } else {
                    scope = Some(Scope::Caller(value.to_string()));
                }
            } else if let Some(value) = lower.strip_prefix("has:") {
                if matches!(value, "attachment" | "attachments") {
                    has_attachment = Some(!negated);
                }
            } else {
                let (field, value) = split_field(body);
                let (exact, value) = unquote(value);
                terms.push(QueryTerm {
                    field,
                    value: value.to_lowercase(),
                    exact,
                    negated,
                });
            }
        }

        Self {
            base: kept.join(" "),
            terms,
            scope: scope.unwrap_or(Scope::Anywhere),
            excluded,
            has_attachment,
            window: window.clone(),
            reference,
        }
    }

    /// Whether the engine widened the scope (the caller gave no `in:`).
    pub fn is_widened(&self) -> bool {
        self.scope == Scope::Anywhere
    }

    /// Render as a provider search string.
    ///
    /// `"from:bank in:anywhere older_than:365d"`
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.base.is_empty() {
            parts.push(self.base.clone());
        }
        if self.is_widened() {
            parts.push(format!("in:{ANYWHERE}"));
        }
        parts.push(format!("older_than:{}d", self.window.older_than_days));
        if let Some(days) = self.window.newer_than_days {
            parts.push(format!("newer_than:{days}d"));
        }
        if let Some(from) = self.window.resume_from {
            parts.push(format!("after:{}", from.format("%Y/%m/%d")));
        }
        parts.join(" ")
    }

    /// Evaluate the query against a candidate.
    ///
    /// Candidates without a timestamp pass the age checks; the engine
    /// rejects them during ingestion instead.
    pub fn matches(&self, c: &Candidate<'_>) -> bool {
        if let Some(ts) = c.timestamp {
            if ts > self.reference - self.window.older_than() {
                return false;
            }
            if let Some(newer) = self.window.newer_than() {
                if ts <= self.reference - newer {
                    return false;
                }
            }
            if let Some(from) = self.window.resume_from {
                if ts < from {
                    return false;
                }
            }
        }

        if let Scope::Caller(location) = &self.scope {
            if location != ANYWHERE
                && location != "all"
                && !c.labels.iter().any(|l| l.eq_ignore_ascii_case(location))
            {
                return false;
            }
        }

        if self
            .excluded
            .iter()
            .any(|location| c.labels.iter().any(|l| l.eq_ignore_ascii_case(location)))
        {
            return false;
        }

        if let Some(want) = self.has_attachment {
            if c.has_attachments != want {
                return false;
            }
        }

        self.terms.iter().all(|t| term_matches(t, c) != t.negated)
    }
}

impl std::fmt::Display for ScopedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

fn term_matches(term: &QueryTerm, c: &Candidate<'_>) -> bool {
    // Quoted phrases are matched as a whole, still case-insensitively.
    let hit = |haystack: &str| haystack.to_lowercase().contains(&term.value);
    match term.field {
        QueryField::All => hit(c.subject) || hit(c.from) || hit(c.to),
        QueryField::From => hit(c.from),
        QueryField::To => hit(c.to),
        QueryField::Subject => hit(c.subject),
        QueryField::Label => c.labels.iter().any(|l| l.to_lowercase() == term.value),
    }
}

fn split_field(token: &str) -> (QueryField, &str) {
    let fields = [
        ("from:", QueryField::From),
        ("to:", QueryField::To),
        ("subject:", QueryField::Subject),
        ("label:", QueryField::Label),
    ];
    for (prefix, field) in fields {
        if let Some(head) = token.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                return (field, &token[prefix.len()..]);
            }
        }
    }
    (QueryField::All, token)
}

fn unquote(value: &str) -> (bool, &str) {
    match value.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => (true, inner),
        None => (false, value),
    }
}

/// Split on whitespace outside double quotes.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
            current.push(ch);
        } else if ch.is_whitespace() && !in_quotes {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::window::Band;

    fn reference() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn days_ago(days: i64) -> Option<DateTime<Utc>> {
        Some(reference() - chrono::Duration::days(days))
    }

    fn candidate<'a>(ts: Option<DateTime<Utc>>, labels: &'a [String]) -> Candidate<'a> {
        Candidate {
            timestamp: ts,
            subject: "Quarterly Report",
            from: "Alice <alice@example.com>",
            to: "bob@example.com",
            labels,
            has_attachments: true,
        }
    }

    #[test]
    fn test_scope_widened_by_default() {
        let q = ScopedQuery::new("", &Window::for_band(Band::VeryOld), reference());
        assert!(q.is_widened());
        assert_eq!(q.render(), "in:anywhere older_than:365d");
    }

    #[test]
    fn test_caller_scope_not_doubled() {
        let q = ScopedQuery::new(
            "from:bank in:inbox",
            &Window::for_band(Band::MidRange),
            reference(),
        );
        assert!(!q.is_widened());
        let rendered = q.render();
        assert_eq!(rendered, "from:bank in:inbox older_than:180d newer_than:365d");
        assert_eq!(rendered.matches("in:").count(), 1);
    }

    #[test]
    fn test_explicit_anywhere_not_doubled() {
        let q = ScopedQuery::new("in:anywhere", &Window::for_band(Band::Recent), reference());
        assert_eq!(q.render().matches("in:anywhere").count(), 1);
    }

    #[test]
    fn test_age_qualifiers_dropped_from_base() {
        let q = ScopedQuery::new("older_than:5d label:work", &Window::for_band(Band::Recent), reference());
        assert_eq!(q.render(), "label:work in:anywhere older_than:30d newer_than:180d");
    }

    #[test]
    fn test_render_resume() {
        let mut w = Window::for_band(Band::VeryOld);
        w.resume_from = days_ago(400);
        let q = ScopedQuery::new("", &w, reference());
        assert!(q.render().ends_with("after:2023/05/12"));
    }

    #[test]
    fn test_matches_window_bounds() {
        let labels = vec!["Inbox".to_string()];
        let q = ScopedQuery::new("", &Window::for_band(Band::MidRange), reference());
        assert!(q.matches(&candidate(days_ago(200), &labels)));
        assert!(!q.matches(&candidate(days_ago(100), &labels)));
        assert!(!q.matches(&candidate(days_ago(400), &labels)));
        assert!(q.matches(&candidate(None, &labels)));
    }

    #[test]
    fn test_matches_scope_and_terms() {
        let inbox = vec!["Inbox".to_string(), "Work".to_string()];
        let archived = vec!["Work".to_string()];
        let w = Window::for_band(Band::VeryOld);

        let q = ScopedQuery::new("in:inbox", &w, reference());
        assert!(q.matches(&candidate(days_ago(500), &inbox)));
        assert!(!q.matches(&candidate(days_ago(500), &archived)));

        let q = ScopedQuery::new("", &w, reference());
        assert!(q.matches(&candidate(days_ago(500), &archived)));

        let q = ScopedQuery::new("from:alice -subject:invoice label:work", &w, reference());
        assert!(q.matches(&candidate(days_ago(500), &archived)));

        let q = ScopedQuery::new("\"quarterly report\" -has:attachment", &w, reference());
        assert!(!q.matches(&candidate(days_ago(500), &archived)));
    }

    #[test]
    fn test_negated_scope_excludes_location() {
        let inbox = vec!["Inbox".to_string(), "Work".to_string()];
        let archived = vec!["Work".to_string()];
        let q = ScopedQuery::new("-in:inbox", &Window::for_band(Band::VeryOld), reference());

        assert!(q.is_widened());
        assert_eq!(q.excluded, ["inbox"]);
        assert_eq!(q.render(), "-in:inbox in:anywhere older_than:365d");
        assert!(!q.matches(&candidate(days_ago(500), &inbox)));
        assert!(q.matches(&candidate(days_ago(500), &archived)));
    }
}
