//! In-memory record source for tests and benchmarks.

use std::sync::Mutex;

use super::{candidate_of, FetchService};
use crate::error::{ArchiveError, Result};
use crate::model::record::RawRecord;
use crate::schedule::ScopedQuery;

/// Serves a fixed list of records, in insertion order.
///
/// Can be told to fail the next few searches with a transient error.
#[derive(Debug, Default)]
pub struct MemorySource {
    records: Vec<RawRecord>,
    pending_failures: Mutex<u32>,
    calls: Mutex<u32>,
}

impl MemorySource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    /// Fail the next `count` searches with `TransientIo`.
    pub fn fail_next(&self, count: u32) {
        *self.pending_failures.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }

    /// Number of `search` calls so far, failed ones included.
    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FetchService for MemorySource {
    fn search(&self, query: &ScopedQuery, offset: usize, limit: usize) -> Result<Vec<RawRecord>> {
        *self.calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        {
            let mut failures = self.pending_failures.lock().unwrap_or_else(|e| e.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(ArchiveError::transient(
                    "memory search",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "injected failure"),
                ));
            }
        }

        Ok(self
            .records
            .iter()
            .filter(|r| query.matches(&candidate_of(r)))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Band, Window};
    use chrono::{DateTime, Utc};

    fn reference() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn rec(id: &str, ts: &str, subject: &str) -> RawRecord {
        RawRecord {
            id: id.into(),
            timestamp: Some(ts.into()),
            subject: Some(subject.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_filters_and_pages() {
        let src = MemorySource::new(vec![
            rec("a", "2020-01-01T00:00:00Z", "old one"),
            rec("b", "2020-02-01T00:00:00Z", "old two"),
            rec("c", "2024-06-01T00:00:00Z", "too new"),
            rec("d", "2020-03-01T00:00:00Z", "old three"),
        ]);
        let q = ScopedQuery::new("", &Window::for_band(Band::VeryOld), reference());

        let page = src.search(&q, 0, 2).unwrap();
        assert_eq!(page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        let page = src.search(&q, 2, 2).unwrap();
        assert_eq!(page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["d"]);

        let q = ScopedQuery::new("subject:two", &Window::for_band(Band::VeryOld), reference());
        assert_eq!(src.search(&q, 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let src = MemorySource::new(vec![rec("a", "2020-01-01T00:00:00Z", "x")]);
        let q = ScopedQuery::new("", &Window::for_band(Band::VeryOld), reference());
        src.fail_next(1);
        let err = src.search(&q, 0, 10).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(src.search(&q, 0, 10).unwrap().len(), 1);
        assert_eq!(src.calls(), 2);
    }
}
