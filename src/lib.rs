//! `mailvault`: an incremental, budget-bounded mailbox archiver.
//!
//! Each run fetches a bounded slice of records from a [`source::FetchService`],
//! skips what the ledger or the destination already holds, and writes the rest
//! as a `Year/Month/Day/<record>` folder of artifacts under a single anchor
//! folder. Runs rotate through age bands so a large mailbox is covered over
//! many short invocations.

pub mod archive;
pub mod clock;
pub mod config;
pub mod destination;
pub mod error;
pub mod export;
pub mod kv;
pub mod ledger;
pub mod model;
pub mod retry;
pub mod sanitize;
pub mod schedule;
pub mod source;

pub use archive::{Archiver, EngineConfig, RunOptions, RunReport, RunStatus};
pub use error::{ArchiveError, Result};
