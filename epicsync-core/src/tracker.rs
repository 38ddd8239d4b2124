//! The Tracker Port: the closed capability set every issue-tracker adapter
//! implements.
//!
//! Calls are blocking. The engine wraps every call site in its governor
//! (rate limiter + retry policy); adapters never retry on their own.

use serde::Serialize;

use crate::error::TrackerError;
use crate::issue::{CreatedIssue, FieldUpdate, NewIssue, TrackerIssue};
use crate::types::{IssueKey, Status};

/// Which optional operations an adapter supports.
///
/// The core operations are assumed present unless an adapter says otherwise;
/// the orchestrator refuses to start a phase whose operations are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub create: bool,
    pub update: bool,
    pub transition: bool,
    pub comment: bool,
    pub delete: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            create: true,
            update: true,
            transition: true,
            comment: true,
            delete: false,
        }
    }
}

impl Capabilities {
    pub fn full() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Self {
            create: false,
            update: false,
            transition: false,
            comment: false,
            delete: false,
        }
    }
}

/// Adapter contract for a remote issue tracker.
///
/// `create_story` and `create_subtask` must be idempotent for a repeated
/// [`NewIssue::idempotency_key`] under the same parent; otherwise a retried
/// create can produce duplicates.
pub trait Tracker: Send + Sync {
    /// Adapter tag, e.g. `jira` or `memory`. Used for rate-limit defaults.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// All stories under an epic, each with its subtasks and comments.
    fn fetch_epic_children(&self, epic: &IssueKey) -> Result<Vec<TrackerIssue>, TrackerError>;

    fn fetch_issue(&self, key: &IssueKey) -> Result<TrackerIssue, TrackerError>;

    fn create_story(&self, epic: &IssueKey, data: &NewIssue)
        -> Result<CreatedIssue, TrackerError>;

    fn update_story(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError>;

    fn create_subtask(
        &self,
        parent: &IssueKey,
        data: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError>;

    fn update_subtask(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError>;

    fn transition_status(&self, key: &IssueKey, status: Status) -> Result<(), TrackerError>;

    /// Returns the tracker-assigned comment id.
    fn add_comment(&self, key: &IssueKey, body: &str) -> Result<String, TrackerError>;

    fn delete_issue(&self, _key: &IssueKey) -> Result<(), TrackerError> {
        Err(TrackerError::Unsupported {
            operation: "delete_issue",
        })
    }

    fn delete_comment(&self, _key: &IssueKey, _comment_id: &str) -> Result<(), TrackerError> {
        Err(TrackerError::Unsupported {
            operation: "delete_comment",
        })
    }
}
