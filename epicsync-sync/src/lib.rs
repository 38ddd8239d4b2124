//! # epicsync-sync
//!
//! Reconciliation and execution engine.
//!
//! Build a [`SyncOrchestrator`] over any [`Tracker`](epicsync_core::Tracker)
//! and call [`SyncOrchestrator::run`] with a parsed epic and a writeback
//! collaborator. Backups can be listed, diffed and restored on their own
//! through [`BackupStore`].

pub mod backup;
pub mod batch;
pub mod command;
pub mod conflict;
pub mod error;
pub mod hash;
pub mod matcher;
pub mod orchestrator;
pub mod planner;
pub mod ratelimit;
pub mod result;
pub mod sync_state;

pub use backup::{Backup, BackupId, BackupStore, BackupSummary, FieldChange};
pub use batch::{BatchOptions, BatchReport, CancelToken, CommandBatch, ExecutionMode};
pub use command::{Command, CommandOutcome, IssueRef};
pub use conflict::{ChangeState, ConflictRecord, Resolution};
pub use error::{ExitCode, SyncError};
pub use matcher::{MatchMethod, MatchResult, Matcher};
pub use orchestrator::{SyncOptions, SyncOrchestrator};
pub use planner::Planner;
pub use ratelimit::{Governor, GovernorStats, ManualClock, RetryPolicy, SystemClock, TokenBucket};
pub use result::{ErrorDescriptor, RunState, SyncCounts, SyncResult};
