//! The run orchestrator: fetch, deduplicate, write, and record, under a
//! wall-clock budget.
//!
//! A run moves through these phases:
//!
//! ```text
//! Idle -> WindowSelected -> Fetching -> ProcessingRecord* -> Checkpointing -> Done
//!                                                    \-> BudgetExceeded
//! ```
//!
//! Per-record failures are contained in the [`RunReport`]; only invalid
//! options fail [`Archiver::run_once`] itself.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::destination::path::PathResolver;
use crate::destination::{AuditReport, DestinationStore, ExistenceProbe, FolderHandle};
use crate::error::{ArchiveError, Result};
use crate::export::writer::{ArtifactWriter, WriterConfig};
use crate::kv::KeyValueStore;
use crate::ledger::{LedgerEntry, LedgerStore, SUBJECT_SNAPSHOT_LEN};
use crate::model::record::{parse_timestamp, RawRecord, Record};
use crate::retry::RetryPolicy;
use crate::schedule::{select_window, Band, CycleState, RunCursor, ScopedQuery, Window};
use crate::source::FetchService;

/// Default anchor folder name.
pub const DEFAULT_ANCHOR: &str = "Mail Archive";

/// Per-invocation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Most candidates fetched in one run. Must be positive.
    pub max_records: usize,
    /// Wall-clock budget. Must be positive.
    pub time_budget: Duration,
    /// Ignore the ledger and the destination; write every candidate again.
    pub force_reprocess: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_records: 100,
            time_budget: Duration::from_secs(300),
            force_reprocess: false,
        }
    }
}

/// Settings that stay the same from run to run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Caller's search query; the window and scope are added to it.
    pub base_query: String,
    pub page_size: usize,
    /// Pause between two records.
    pub pacing: Duration,
    /// Persist the ledger after this many new entries.
    pub checkpoint_every: usize,
    /// Confirm ledger hits against the destination and rewrite missing records.
    pub verify_ledger_hits: bool,
    pub anchor: FolderHandle,
    pub writer: WriterConfig,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_query: String::new(),
            page_size: 50,
            pacing: Duration::ZERO,
            checkpoint_every: 25,
            verify_ledger_hits: false,
            anchor: FolderHandle::root().child(DEFAULT_ANCHOR),
            writer: WriterConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Idle,
    WindowSelected,
    Fetching,
    ProcessingRecord,
    Checkpointing,
    Done,
    BudgetExceeded,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every fetched candidate was handled.
    Done,
    /// The time budget ran out with candidates left; the cursor says where
    /// the next run resumes.
    BudgetExceeded,
    /// Fetching or preparing the destination failed; nothing was processed
    /// and the cursor was left alone.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Archived,
    Skipped,
    Error,
}

/// What happened to one candidate (or to the run, for run-level errors).
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub id: String,
    pub outcome: ItemOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub skipped_attachments: usize,
}

impl ItemReport {
    fn new(id: impl Into<String>, outcome: ItemOutcome, reason: Option<String>) -> Self {
        Self {
            id: id.into(),
            outcome,
            reason,
            folder: None,
            skipped_attachments: 0,
        }
    }

    fn error(id: impl Into<String>, err: &ArchiveError) -> Self {
        Self::new(id, ItemOutcome::Error, Some(err.to_string()))
    }
}

/// Summary of one [`Archiver::run_once`] call.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub window: Window,
    pub query: String,
    pub fetched: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub items: Vec<ItemReport>,
    /// Cursor saved at the end of the run (`None` when the run aborted).
    pub cursor: Option<RunCursor>,
    pub ledger_recovered: bool,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    fn push(&mut self, item: ItemReport) {
        match item.outcome {
            ItemOutcome::Archived => self.processed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Error => self.errors += 1,
        }
        self.items.push(item);
    }
}

/// Ledger and cursor state, without running anything.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub total_tracked: usize,
    pub last_window: Option<Band>,
    pub last_cursor: Option<RunCursor>,
}

/// Progress callback: `(handled, total)`.
pub type ProgressFn = Box<dyn Fn(usize, usize)>;

/// The archival engine.
pub struct Archiver<F: FetchService, D: DestinationStore, K: KeyValueStore, C: Clock> {
    source: F,
    store: D,
    ledger: LedgerStore<K>,
    clock: C,
    config: EngineConfig,
    progress: Option<ProgressFn>,
}

impl<F, D, K, C> Archiver<F, D, K, C>
where
    F: FetchService,
    D: DestinationStore,
    K: KeyValueStore,
    C: Clock,
{
    pub fn new(source: F, store: D, ledger: LedgerStore<K>, clock: C, config: EngineConfig) -> Self {
        Self {
            source,
            store,
            ledger,
            clock,
            config,
            progress: None,
        }
    }

    /// Report `(handled, total)` after every candidate.
    pub fn with_progress(mut self, progress: impl Fn(usize, usize) + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &LedgerStore<K> {
        &self.ledger
    }

    /// Run one bounded archival pass.
    pub fn run_once(&mut self, options: &RunOptions) -> Result<RunReport> {
        if options.max_records == 0 {
            return Err(ArchiveError::InvalidInput("max_records must be positive".into()));
        }
        if options.time_budget.is_zero() {
            return Err(ArchiveError::InvalidInput("time budget must be positive".into()));
        }

        let started = self.clock.now();
        let mut phase = RunPhase::Idle;

        let previous = self.ledger.load_cursor().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read run cursor, starting fresh");
            None
        });
        let window = select_window(&CycleState {
            today: started.date_naive(),
            cursor: previous,
        });
        let query = ScopedQuery::new(&self.config.base_query, &window, started);
        enter(&mut phase, RunPhase::WindowSelected);
        info!(
            band = %window.band,
            resume_from = ?window.resume_from,
            query = %query,
            "Selected window"
        );

        let mut report = RunReport {
            status: RunStatus::Done,
            window: window.clone(),
            query: query.render(),
            fetched: 0,
            processed: 0,
            skipped: 0,
            errors: 0,
            items: Vec::new(),
            cursor: None,
            ledger_recovered: self.ledger.recovered_from_corruption(),
            elapsed_ms: 0,
        };

        enter(&mut phase, RunPhase::Fetching);
        let prepared = PathResolver::new(&self.store, self.config.anchor.clone())
            .ensure_anchor()
            .and_then(|_| self.fetch(&query, options.max_records));
        let candidates = match prepared {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Run aborted before processing");
                report.status = RunStatus::Aborted;
                report.push(ItemReport::error("<run>", &e));
                report.elapsed_ms = self.elapsed_ms(started);
                return Ok(report);
            }
        };
        report.fetched = candidates.len();

        let total = candidates.len();
        let mut last_timestamp: Option<DateTime<Utc>> = None;
        let mut since_checkpoint = 0;

        for (index, raw) in candidates.into_iter().enumerate() {
            if index > 0 && !self.config.pacing.is_zero() {
                self.clock.sleep(self.config.pacing);
            }
            enter(&mut phase, RunPhase::ProcessingRecord);

            let timestamp = raw.timestamp.as_deref().and_then(parse_timestamp);
            let item = self.process(raw, options.force_reprocess);
            if item.outcome != ItemOutcome::Error {
                last_timestamp = last_timestamp.max(timestamp);
            }
            if item.outcome == ItemOutcome::Archived {
                since_checkpoint += 1;
            }
            report.push(item);

            if since_checkpoint >= self.config.checkpoint_every.max(1) {
                enter(&mut phase, RunPhase::Checkpointing);
                if let Err(e) = self.ledger.persist(self.clock.now()) {
                    warn!(error = %e, "Checkpoint failed");
                    report.push(ItemReport::error("<ledger>", &e));
                }
                since_checkpoint = 0;
            }

            if let Some(progress) = &self.progress {
                progress(index + 1, total);
            }

            let elapsed = self.clock.now() - started;
            if elapsed >= budget(options) && index + 1 < total {
                info!(
                    handled = index + 1,
                    remaining = total - index - 1,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "Time budget exhausted"
                );
                report.status = RunStatus::BudgetExceeded;
                break;
            }
        }

        enter(&mut phase, RunPhase::Checkpointing);
        if self.ledger.is_dirty() {
            if let Err(e) = self.ledger.persist(self.clock.now()) {
                warn!(error = %e, "Could not persist ledger");
                report.push(ItemReport::error("<ledger>", &e));
            }
        }

        // A run that stopped on max_records has not seen the whole window.
        let exhausted = report.status == RunStatus::Done && report.fetched < options.max_records;
        let cursor = RunCursor {
            last_window: Some(window.band),
            last_record_timestamp: last_timestamp.or(window.resume_from),
            completed: exhausted,
            updated_at: self.clock.now(),
        };
        if let Err(e) = self.ledger.save_cursor(&cursor) {
            warn!(error = %e, "Could not save run cursor");
            report.push(ItemReport::error("<cursor>", &e));
        }
        report.cursor = Some(cursor);

        enter(
            &mut phase,
            match report.status {
                RunStatus::BudgetExceeded => RunPhase::BudgetExceeded,
                _ => RunPhase::Done,
            },
        );
        report.elapsed_ms = self.elapsed_ms(started);
        info!(
            status = ?report.status,
            fetched = report.fetched,
            processed = report.processed,
            skipped = report.skipped,
            errors = report.errors,
            elapsed_ms = report.elapsed_ms,
            "Run finished"
        );
        Ok(report)
    }

    /// Ledger size and the stored cursor.
    pub fn statistics(&self) -> Result<Statistics> {
        let cursor = self.ledger.load_cursor()?;
        Ok(Statistics {
            total_tracked: self.ledger.len(),
            last_window: cursor.as_ref().and_then(|c| c.last_window),
            last_cursor: cursor,
        })
    }

    /// Look for archive folders created outside the anchor.
    pub fn audit(&self) -> Result<AuditReport> {
        PathResolver::new(&self.store, self.config.anchor.clone()).audit_tree()
    }

    /// Collect up to `max` candidates, page by page.
    fn fetch(&self, query: &ScopedQuery, max: usize) -> Result<Vec<RawRecord>> {
        let page_size = self.config.page_size.max(1);
        let mut candidates = Vec::new();

        while candidates.len() < max {
            let offset = candidates.len();
            let limit = page_size.min(max - offset);
            let page = self.config.retry.run(&self.clock, "search", || {
                self.source.search(query, offset, limit)
            })?;
            debug!(offset, limit, received = page.len(), "Fetched page");

            let last_page = page.len() < limit;
            candidates.extend(page.into_iter().take(limit));
            if last_page {
                break;
            }
        }
        Ok(candidates)
    }

    fn process(&mut self, raw: RawRecord, force: bool) -> ItemReport {
        let id = raw.id.trim().to_string();

        if !force && self.ledger.contains(&id) && !self.config.verify_ledger_hits {
            debug!(record = %id, "Already in ledger");
            return ItemReport::new(id, ItemOutcome::Skipped, Some("already in ledger".into()));
        }

        let record = match Record::ingest(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(record = %id, error = %e, "Record rejected");
                return ItemReport::error(id, &e);
            }
        };

        if !force {
            match self.probe(&record) {
                Ok(true) => {
                    if self.ledger.contains(&record.id) {
                        return ItemReport::new(id, ItemOutcome::Skipped, Some("already in ledger".into()));
                    }
                    info!(record = %record.id, "Found in destination, back-filling ledger");
                    let entry = self.ledger_entry(&record);
                    self.ledger.record(entry);
                    return ItemReport::new(
                        id,
                        ItemOutcome::Skipped,
                        Some("already in destination".into()),
                    );
                }
                Ok(false) if self.ledger.contains(&record.id) => {
                    warn!(record = %record.id, "Ledger entry without artifact, archiving again");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(record = %record.id, error = %e, "Existence probe failed");
                    return ItemReport::error(id, &e);
                }
            }
        }

        match self.archive(&record) {
            Ok(mut item) => {
                let entry = self.ledger_entry(&record);
                self.ledger.record(entry);
                item.id = id;
                item
            }
            Err(e) => {
                warn!(record = %record.id, error = %e, "Could not archive record");
                ItemReport::error(id, &e)
            }
        }
    }

    fn probe(&self, record: &Record) -> Result<bool> {
        self.config.retry.run(&self.clock, "probe", || {
            ExistenceProbe::exists(&self.store, &self.config.anchor, record)
        })
    }

    fn archive(&self, record: &Record) -> Result<ItemReport> {
        let resolver = PathResolver::new(&self.store, self.config.anchor.clone());
        let writer = ArtifactWriter::new(
            &self.store,
            self.config.anchor.clone(),
            self.config.writer.clone(),
            &self.clock,
        );

        let written = self.config.retry.run(&self.clock, "write", || {
            let folder = resolver.resolve_record(record)?;
            writer.write(Some(record), Some(&folder))
        })?;

        info!(
            record = %record.id,
            folder = %written.folder,
            files = written.written.len(),
            skipped_attachments = written.skipped_attachments.len(),
            "Archived record"
        );
        let mut item = ItemReport::new(record.id.clone(), ItemOutcome::Archived, None);
        item.folder = Some(written.folder.to_string());
        item.skipped_attachments = written.skipped_attachments.len();
        Ok(item)
    }

    fn ledger_entry(&self, record: &Record) -> LedgerEntry {
        LedgerEntry::new(
            record.id.clone(),
            self.clock.now(),
            record.subject_snapshot(SUBJECT_SNAPSHOT_LEN),
        )
    }

    fn elapsed_ms(&self, started: DateTime<Utc>) -> u64 {
        (self.clock.now() - started).num_milliseconds().max(0) as u64
    }
}

fn budget(options: &RunOptions) -> chrono::Duration {
    chrono::Duration::from_std(options.time_budget).unwrap_or(chrono::Duration::MAX)
}

fn enter(phase: &mut RunPhase, next: RunPhase) {
    if *phase != next {
        debug!(from = ?*phase, to = ?next, "Run phase");
        *phase = next;
    }
}
