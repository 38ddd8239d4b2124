//! Error types for epicsync-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{IssueKey, StoryId};

/// Failures a Tracker Port call can report.
///
/// [`TrackerError::is_transient`] decides whether the retry policy may try
/// the call again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// Network-level failure: refused, reset, DNS, or a timeout.
    #[error("connection error: {message}")]
    Connection { message: String, timed_out: bool },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    /// Any HTTP-level error response, including 429 and 5xx.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// An optional capability (delete) the adapter does not offer.
    #[error("{operation} is not supported by this tracker")]
    Unsupported { operation: &'static str },
}

impl TrackerError {
    pub fn connection(message: impl Into<String>) -> Self {
        TrackerError::Connection {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        TrackerError::Connection {
            message: message.into(),
            timed_out: true,
        }
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        TrackerError::Api {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(key: &IssueKey) -> Self {
        TrackerError::api(404, format!("issue {key} does not exist"))
    }

    pub fn rate_limited() -> Self {
        TrackerError::api(429, "too many requests")
    }

    /// Timeouts, connection failures, 429 and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            TrackerError::Connection { .. } => true,
            TrackerError::Api { status, .. } => *status == 429 || (500..600).contains(status),
            TrackerError::Auth(_)
            | TrackerError::Permission(_)
            | TrackerError::Unsupported { .. } => false,
        }
    }

    /// Short machine-readable class name used in error descriptors.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::Connection { .. } => "connection",
            TrackerError::Auth(_) => "auth",
            TrackerError::Permission(_) => "permission",
            TrackerError::Api { .. } => "api",
            TrackerError::Unsupported { .. } => "unsupported",
        }
    }
}

/// Malformed document input.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid document: {0}")]
    Invalid(String),
}

/// Errors from the tracker registry and the reference adapters it builds.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown tracker type '{tag}' (known: {known})")]
    UnknownTracker { tag: String, known: String },

    #[error("tracker '{tag}' requires setting '{setting}'")]
    MissingSetting { tag: String, setting: &'static str },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tracker store JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors loading or validating [`crate::config::SyncConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Errors persisting identity back into the document source.
#[derive(Debug, Error)]
pub enum WritebackError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("story {0} not found in document source")]
    StoryNotFound(StoryId),
}
