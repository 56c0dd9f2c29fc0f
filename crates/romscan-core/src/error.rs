use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while identifying content or writing collections.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The file vanished, could not be opened, or a read came up short.
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archive or disc-sheet structure could not be parsed.
    #[error("malformed container {}: {reason}", path.display())]
    MalformedContainer { path: PathBuf, reason: String },

    #[error("out of memory while accumulating results")]
    AllocationFailed,

    /// A signature table file is missing or cannot be queried.
    #[error("signature table '{table}' unavailable: {reason}")]
    DatabaseUnavailable { table: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scan cancelled")]
    Cancelled,

    /// Reported by every step after a scan has already failed.
    #[error("scan aborted: {0}")]
    Aborted(String),
}

impl ScanError {
    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScanError::Unreadable {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ScanError::MalformedContainer {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether a directory scan can drop the current candidate and carry on.
    ///
    /// Single-file scans additionally treat `MalformedContainer` as terminal;
    /// that decision lives in the scan task.
    pub fn is_candidate_local(&self) -> bool {
        matches!(
            self,
            ScanError::Unreadable { .. }
                | ScanError::MalformedContainer { .. }
                | ScanError::DatabaseUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
