//! What a sync run reports back.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use epicsync_core::config::Phase;
use epicsync_core::issue::IssueFields;
use epicsync_core::types::{IssueKey, StoryId};

use crate::backup::BackupId;
use crate::conflict::{ConflictRecord, Resolution};
use crate::error::ExitCode;
use crate::matcher::MatchResult;
use crate::ratelimit::GovernorStats;

/// Orchestrator states, in the order a run can visit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum RunState {
    Init,
    BackingUp,
    Matching,
    Planning(Phase),
    Executing(Phase),
    ConflictCheck,
    Reporting,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Init => write!(f, "init"),
            RunState::BackingUp => write!(f, "backing-up"),
            RunState::Matching => write!(f, "matching"),
            RunState::Planning(phase) => write!(f, "planning({phase})"),
            RunState::Executing(phase) => write!(f, "executing({phase})"),
            RunState::ConflictCheck => write!(f, "conflict-check"),
            RunState::Reporting => write!(f, "reporting"),
            RunState::Done => write!(f, "done"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub matched: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Where a recorded error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A tracker command failed.
    Command,
    /// A transactional rollback step failed.
    Rollback,
    /// The writeback collaborator rejected an update.
    Writeback,
    /// The sync-state file could not be refreshed.
    State,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story: Option<StoryId>,
    /// Command kind (`update_description`, ...) for command errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Remote values applied to the document in a bidirectional run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PulledChange {
    pub story: StoryId,
    pub issue: IssueKey,
    pub fields: IssueFields,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub epic: IssueKey,
    pub dry_run: bool,
    pub counts: SyncCounts,
    /// Commands that reached the tracker (or were previewed, in a dry run).
    pub attempted: usize,
    pub errors: Vec<ErrorDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<BackupId>,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub matches: Vec<MatchResult>,
    pub conflicts: Vec<ConflictRecord>,
    pub pulled: Vec<PulledChange>,
    pub previews: Vec<String>,
    pub states: Vec<RunState>,
    pub cancelled: bool,
    pub governor: GovernorStats,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl SyncResult {
    pub fn new(epic: &IssueKey, dry_run: bool) -> Self {
        Self {
            epic: epic.clone(),
            dry_run,
            counts: SyncCounts::default(),
            attempted: 0,
            errors: Vec::new(),
            backup_id: None,
            elapsed: Duration::ZERO,
            matches: Vec::new(),
            conflicts: Vec::new(),
            pulled: Vec::new(),
            previews: Vec::new(),
            states: Vec::new(),
            cancelled: false,
            governor: GovernorStats::default(),
        }
    }

    pub fn unresolved_conflicts(&self) -> usize {
        self.conflicts
            .iter()
            .filter(|c| c.resolution == Resolution::Unresolved)
            .count()
    }

    /// Nothing attempted is a success; everything attempted failing is an
    /// API failure; anything in between, or an open conflict, is partial.
    pub fn exit_code(&self) -> ExitCode {
        if self.cancelled {
            ExitCode::Cancelled
        } else if self.attempted > 0 && self.counts.failed >= self.attempted {
            ExitCode::ApiFailure
        } else if self.counts.failed > 0 || self.unresolved_conflicts() > 0 || !self.errors.is_empty() {
            ExitCode::Partial
        } else {
            ExitCode::Success
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == ExitCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epicsync_core::types::Status;

    fn result() -> SyncResult {
        SyncResult::new(&IssueKey::from("EPIC-1"), false)
    }

    fn fields() -> IssueFields {
        IssueFields {
            summary: "Login".into(),
            description: String::new(),
            status: Status::Open,
            priority: None,
            story_points: None,
        }
    }

    #[test]
    fn nothing_attempted_is_success() {
        assert_eq!(result().exit_code(), ExitCode::Success);
    }

    #[test]
    fn attempted_counts_drive_exit_code() {
        let mut r = result();
        r.attempted = 3;
        r.counts.failed = 3;
        assert_eq!(r.exit_code(), ExitCode::ApiFailure);
        r.counts.failed = 1;
        assert_eq!(r.exit_code(), ExitCode::Partial);
        r.counts.failed = 0;
        assert_eq!(r.exit_code(), ExitCode::Success);
    }

    #[test]
    fn unresolved_conflict_is_partial() {
        let mut r = result();
        r.conflicts.push(ConflictRecord {
            story: "US-1".into(),
            issue: "PROJ-1".into(),
            local: fields(),
            remote: fields(),
            resolution: Resolution::Unresolved,
            merged: None,
        });
        assert_eq!(r.exit_code().code(), 64);
    }

    #[test]
    fn cancellation_wins() {
        let mut r = result();
        r.attempted = 2;
        r.counts.failed = 2;
        r.cancelled = true;
        assert_eq!(r.exit_code().code(), 80);
    }

    #[test]
    fn serializes_elapsed_as_millis() {
        let mut r = result();
        r.elapsed = Duration::from_millis(1500);
        r.states = vec![RunState::Init, RunState::Executing(Phase::Subtasks)];
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["elapsed"], 1500);
        assert_eq!(json["states"][1]["phase"], "subtasks");
    }
}
