//! Error types for epicsync-sync.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use epicsync_core::error::TrackerError;

/// Process exit status a caller should report for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success,
    /// Some commands (or conflicts) did not go through; others did.
    Partial,
    /// Nothing reached the tracker.
    ApiFailure,
    /// Rejected before any write.
    Validation,
    Cancelled,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Partial => 64,
            ExitCode::ApiFailure => 8,
            ExitCode::Validation => 6,
            ExitCode::Cancelled => 80,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExitCode::Success => "success",
            ExitCode::Partial => "partial success",
            ExitCode::ApiFailure => "API failure",
            ExitCode::Validation => "validation failure",
            ExitCode::Cancelled => "cancelled",
        };
        write!(f, "{label} ({})", self.code())
    }
}

/// Errors that abort a run (or a backup/state operation) as a whole.
///
/// Per-command failures never surface here; they are recorded in the
/// run's result instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad document, options, or tracker capability set.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The first tracker call failed after retries.
    #[error("cannot reach tracker: {0}")]
    Connectivity(#[source] TrackerError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// A pre-sync snapshot could not be written; nothing was changed.
    #[error("backup error: {0}")]
    Backup(String),

    #[error("backup {0} not found")]
    BackupNotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            SyncError::Validation(_) => ExitCode::Validation,
            SyncError::Cancelled => ExitCode::Cancelled,
            SyncError::Connectivity(_)
            | SyncError::Tracker(_)
            | SyncError::Backup(_)
            | SyncError::BackupNotFound(_)
            | SyncError::Io { .. }
            | SyncError::Json { .. } => ExitCode::ApiFailure,
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`SyncError::Json`].
pub(crate) fn json_err(path: impl Into<PathBuf>, source: serde_json::Error) -> SyncError {
    SyncError::Json {
        path: path.into(),
        source,
    }
}
