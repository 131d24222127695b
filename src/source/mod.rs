//! Record sources: where candidate records come from.
//!
//! A [`FetchService`] answers a [`ScopedQuery`] with pages of raw records in
//! chronological order. Sources never validate; the engine does that once in
//! [`Record::ingest`](crate::model::Record::ingest).

pub mod mbox;
pub mod memory;

pub use mbox::MboxSource;
pub use memory::MemorySource;

use crate::error::Result;
use crate::model::record::{parse_timestamp, RawRecord};
use crate::schedule::{Candidate, ScopedQuery};

/// Search interface over a record collection.
pub trait FetchService {
    /// Return at most `limit` matching records, skipping the first `offset`
    /// matches, oldest first.
    fn search(&self, query: &ScopedQuery, offset: usize, limit: usize) -> Result<Vec<RawRecord>>;
}

impl<F: FetchService + ?Sized> FetchService for &F {
    fn search(&self, query: &ScopedQuery, offset: usize, limit: usize) -> Result<Vec<RawRecord>> {
        (**self).search(query, offset, limit)
    }
}

/// View a raw record through the fields a query can test.
pub fn candidate_of(raw: &RawRecord) -> Candidate<'_> {
    Candidate {
        timestamp: raw.timestamp.as_deref().and_then(parse_timestamp),
        subject: raw.subject.as_deref().unwrap_or(""),
        from: raw.from.as_deref().unwrap_or(""),
        to: raw.to.as_deref().unwrap_or(""),
        labels: &raw.labels,
        has_attachments: !raw.attachments.is_empty(),
    }
}
