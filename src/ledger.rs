//! The ledger: which records have already been archived.
//!
//! The ledger is a JSON document kept under a single key of a
//! [`KeyValueStore`]:
//!
//! ```text
//! {
//!   "version": 1,
//!   "entries": {
//!     "<record id>": {
//!       "record_id": "<record id>",
//!       "processed_at": "2024-05-01T10:00:00+00:00",
//!       "subject_snapshot": "Quarterly numbers"
//!     }
//!   }
//! }
//! ```
//!
//! `processed_at` is stored as text so that an entry whose timestamp got
//! mangled still loads. Compaction never drops such entries: if we cannot
//! tell how old an entry is, we keep it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, Result};
use crate::kv::KeyValueStore;
use crate::schedule::RunCursor;

/// Current ledger document version.
pub const LEDGER_VERSION: u32 = 1;

/// Maximum characters kept from a subject in a ledger entry.
pub const SUBJECT_SNAPSHOT_LEN: usize = 80;

/// One archived record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub record_id: String,
    /// RFC 3339 instant. Kept as text; see the module docs.
    pub processed_at: String,
    #[serde(default)]
    pub subject_snapshot: String,
}

impl LedgerEntry {
    pub fn new(
        record_id: impl Into<String>,
        processed_at: DateTime<Utc>,
        subject_snapshot: impl Into<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            processed_at: processed_at.to_rfc3339(),
            subject_snapshot: subject_snapshot.into(),
        }
    }

    /// The processing instant, or `None` if the stored text does not parse.
    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.processed_at.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// What a compaction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Entries older than the retention horizon.
    pub expired: usize,
    /// Entries evicted oldest-first because the document was still too large.
    pub evicted: usize,
    /// Entries kept only because their age is unknown.
    pub undated_kept: usize,
}

/// Map of record id to [`LedgerEntry`]. At most one entry per id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            version: LEDGER_VERSION,
            entries: BTreeMap::new(),
        }
    }

    /// Parse a stored document.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut ledger: Self = serde_json::from_slice(bytes)
            .map_err(|e| ArchiveError::LedgerCorrupt(e.to_string()))?;
        if ledger.version > LEDGER_VERSION {
            return Err(ArchiveError::LedgerCorrupt(format!(
                "unsupported ledger version {}",
                ledger.version
            )));
        }
        // Keys win over the ids embedded in entries.
        for (id, entry) in ledger.entries.iter_mut() {
            if entry.record_id != *id {
                entry.record_id = id.clone();
            }
        }
        ledger.version = LEDGER_VERSION;
        Ok(ledger)
    }

    /// Serialize to compact JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&LedgerEntry> {
        self.entries.get(id)
    }

    /// Insert or replace the entry for `entry.record_id`.
    pub fn insert(&mut self, entry: LedgerEntry) {
        self.entries.insert(entry.record_id.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Shrink the ledger until its encoded form fits in `limit` bytes.
    ///
    /// Does nothing while the document fits. Otherwise drops entries
    /// processed before `now - retention`, then, if still too large, the
    /// oldest dated entries. Undated entries are never dropped; if they alone
    /// exceed the limit the result is `LedgerOverflow` and the ledger is left
    /// as it was.
    pub fn compact(
        &mut self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
        limit: usize,
    ) -> Result<CompactionStats> {
        if self.encode()?.len() <= limit {
            return Ok(CompactionStats::default());
        }
        let mut trial = self.clone();
        let stats = trial.shrink(now - retention, limit)?;
        *self = trial;
        Ok(stats)
    }

    fn shrink(&mut self, horizon: DateTime<Utc>, limit: usize) -> Result<CompactionStats> {
        let mut stats = CompactionStats::default();
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.processed_at() {
            Some(at) => at >= horizon,
            None => true,
        });
        stats.expired = before - self.entries.len();
        stats.undated_kept = self
            .entries
            .values()
            .filter(|e| e.processed_at().is_none())
            .count();
        let mut size = self.encode()?.len();

        if size > limit {
            let mut dated: Vec<(DateTime<Utc>, String)> = self
                .entries
                .values()
                .filter_map(|e| e.processed_at().map(|at| (at, e.record_id.clone())))
                .collect();
            dated.sort();

            for (_, id) in dated {
                if size <= limit {
                    break;
                }
                if let Some(entry) = self.entries.remove(&id) {
                    size = size.saturating_sub(approx_entry_size(&id, &entry));
                    stats.evicted += 1;
                }
                // The estimate may drift; settle it against the real size.
                if size <= limit {
                    size = self.encode()?.len();
                }
            }
        }

        if size > limit {
            return Err(ArchiveError::LedgerOverflow { size, limit });
        }
        Ok(stats)
    }
}

/// Bytes an entry contributes to the encoded document, including its key.
fn approx_entry_size(id: &str, entry: &LedgerEntry) -> usize {
    let key = serde_json::to_vec(id).map(|k| k.len()).unwrap_or(id.len() + 2);
    let value = serde_json::to_vec(entry).map(|v| v.len()).unwrap_or(0);
    key + value + 2
}

/// Settings for [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Compact when the encoded ledger grows beyond this many bytes.
    pub ceiling_bytes: usize,
    /// Entries older than this are the first to go during compaction.
    pub retention: chrono::Duration,
    pub ledger_key: String,
    pub cursor_key: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: 400 * 1024,
            retention: chrono::Duration::days(90),
            ledger_key: "ledger".to_string(),
            cursor_key: "cursor".to_string(),
        }
    }
}

/// Sole owner of the ledger and run cursor in a key-value store.
pub struct LedgerStore<K: KeyValueStore> {
    kv: K,
    config: LedgerConfig,
    ledger: Ledger,
    dirty: bool,
    recovered: bool,
}

impl<K: KeyValueStore> LedgerStore<K> {
    /// Load the ledger from `kv`.
    ///
    /// A stored document that fails to parse is logged and replaced by an
    /// empty ledger; the existence probe covers for the lost entries.
    pub fn open(kv: K, config: LedgerConfig) -> Result<Self> {
        let mut recovered = false;
        let ledger = match kv.get(&config.ledger_key)? {
            None => Ledger::new(),
            Some(bytes) => match Ledger::decode(&bytes) {
                Ok(ledger) => {
                    debug!(entries = ledger.len(), "Loaded ledger");
                    ledger
                }
                Err(e) => {
                    warn!(error = %e, bytes = bytes.len(), "Ledger unreadable, starting empty");
                    recovered = true;
                    Ledger::new()
                }
            },
        };
        Ok(Self {
            kv,
            config,
            ledger,
            dirty: recovered,
            recovered,
        })
    }

    /// The in-memory ledger.
    pub fn load(&self) -> &Ledger {
        &self.ledger
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ledger.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&LedgerEntry> {
        self.ledger.get(id)
    }

    /// Record a successfully archived record. Persisted on the next `persist`.
    pub fn record(&mut self, entry: LedgerEntry) {
        self.ledger.insert(entry);
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.is_empty()
    }

    /// Whether `open` had to discard an unreadable ledger.
    pub fn recovered_from_corruption(&self) -> bool {
        self.recovered
    }

    /// Whether there are changes not yet persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Compact if needed and write the ledger back.
    pub fn persist(&mut self, now: DateTime<Utc>) -> Result<CompactionStats> {
        let limit = self.config.ceiling_bytes.min(self.kv.max_value_size());
        let stats = self.ledger.compact(now, self.config.retention, limit)?;
        if stats.expired + stats.evicted > 0 {
            info!(
                expired = stats.expired,
                evicted = stats.evicted,
                undated_kept = stats.undated_kept,
                remaining = self.ledger.len(),
                "Compacted ledger"
            );
        }
        let bytes = self.ledger.encode()?;
        self.kv.set(&self.config.ledger_key, &bytes)?;
        self.dirty = false;
        debug!(entries = self.ledger.len(), bytes = bytes.len(), "Persisted ledger");
        Ok(stats)
    }

    /// The stored run cursor. An unreadable cursor is treated as absent.
    pub fn load_cursor(&self) -> Result<Option<RunCursor>> {
        let Some(bytes) = self.kv.get(&self.config.cursor_key)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(cursor) => Ok(Some(cursor)),
            Err(e) => {
                warn!(error = %e, "Run cursor unreadable, ignoring it");
                Ok(None)
            }
        }
    }

    pub fn save_cursor(&self, cursor: &RunCursor) -> Result<()> {
        let bytes = serde_json::to_vec(cursor)?;
        self.kv.set(&self.config.cursor_key, &bytes)
    }
}
