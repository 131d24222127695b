//! Centralized error types for mailvault.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailvault library.
///
/// Running out of time budget is not an error; see
/// [`RunStatus::BudgetExceeded`](crate::archive::RunStatus::BudgetExceeded).
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// A required argument was missing or malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A field failed sanitation, size, or type policy. The item is skipped.
    #[error("Rejected {item}: {reason}")]
    ValidationRejected { item: String, reason: String },

    /// A destination folder does not descend from the archive anchor.
    #[error("Folder '{folder}' is not inside anchor '{anchor}'")]
    PathIntegrityViolation { folder: String, anchor: String },

    /// The persisted ledger could not be parsed.
    #[error("Corrupt ledger: {0}")]
    LedgerCorrupt(String),

    /// The ledger cannot be compacted below the storage limit.
    #[error("Ledger of {size} bytes exceeds the {limit} byte limit after compaction")]
    LedgerOverflow { size: usize, limit: usize },

    /// A fetch, store, or key-value operation failed in a way worth retrying.
    #[error("Transient I/O failure during {context}: {source}")]
    TransientIo {
        context: String,
        source: std::io::Error,
    },

    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A structured document failed to serialize or deserialize.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The record source could not be read.
    #[error("Source error: {0}")]
    Source(String),
}

/// Convenience alias for `Result<T, ArchiveError>`.
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `TransientIo` variant with a short description of the operation.
    pub fn transient(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::TransientIo {
            context: context.into(),
            source,
        }
    }

    /// Create a `ValidationRejected` variant.
    pub fn rejected(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationRejected {
            item: item.into(),
            reason: reason.into(),
        }
    }

    /// Whether the retry policy should attempt the operation again.
    ///
    /// Filesystem errors that usually clear up on their own (interrupted
    /// calls, timeouts, busy resources) count as transient as well.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientIo { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare; prefer `ArchiveError::io`).
impl From<std::io::Error> for ArchiveError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
