//! The sync state machine.
//!
//! ```text
//! Init -> BackingUp -> Matching -> { Planning(p) -> Executing(p) }* -> ConflictCheck -> Reporting -> Done
//!                                                      (any state) -> Failed
//! ```
//!
//! Every tracker call of a run goes through one [`Governor`]. Command
//! failures are recorded in the [`SyncResult`]; only validation, the first
//! fetch and the backup can abort a run.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use epicsync_core::config::{
    ConflictStrategy, Phase, RateLimitConfig, RetryConfig, SimilarityKind, SyncConfig,
};
use epicsync_core::document::{check_document, Writeback};
use epicsync_core::issue::TrackerIssue;
use epicsync_core::tracker::Tracker;
use epicsync_core::types::{Epic, IssueKey, Status, Story, StoryId};

use crate::backup::{BackupId, BackupStore};
use crate::batch::{BatchOptions, BatchReport, CancelToken, CommandBatch, ExecutionMode};
use crate::command::{Command, CommandOutcome};
use crate::conflict::{self, Resolution};
use crate::error::SyncError;
use crate::hash::story_hash;
use crate::matcher::Matcher;
use crate::planner::Planner;
use crate::ratelimit::{Clock, GovernedTracker, Governor, RetryPolicy, SystemClock, TokenBucket};
use crate::result::{ErrorDescriptor, ErrorKind, PulledChange, RunState, SyncResult};
use crate::sync_state::{self, StoryState, SyncStateFile};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub phases: Vec<Phase>,
    pub dry_run: bool,
    pub bidirectional: bool,
    pub conflict_strategy: ConflictStrategy,
    pub threshold: f64,
    pub similarity: SimilarityKind,
    pub parallelism: usize,
    pub mode: ExecutionMode,
    /// Snapshot the epic before writing (needs a [`BackupStore`]).
    pub backup: bool,
    pub keep_backups: Option<usize>,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            phases: config.phases.clone(),
            dry_run: false,
            bidirectional: config.bidirectional,
            conflict_strategy: config.conflict_strategy,
            threshold: config.matching.threshold,
            similarity: config.matching.similarity,
            parallelism: config.execution.parallelism,
            mode: if config.execution.transactional {
                ExecutionMode::Transactional
            } else {
                ExecutionMode::BestEffort
            },
            backup: config.backup.enabled,
            keep_backups: config.backup.keep,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Per-run bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Pass {
    /// Current remote view of every matched (or created) story.
    issues: HashMap<StoryId, TrackerIssue>,
    /// Stories planned from merged values instead of the document's.
    overrides: HashMap<StoryId, Story>,
    /// Not pushed this run.
    excluded: HashSet<StoryId>,
    /// Conflicts left open under `ask`.
    unresolved: HashSet<StoryId>,
    pulls: Vec<PulledChange>,
    /// Stories with a failed, skipped or rolled-back command.
    incomplete: HashSet<StoryId>,
    /// Stories with at least one executed command.
    touched: HashSet<StoryId>,
    /// Cancelled, or a transactional batch was rolled back.
    aborted: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SyncOrchestrator<'a> {
    tracker: &'a dyn Tracker,
    options: SyncOptions,
    matcher: Matcher,
    governor: Governor,
    backups: Option<BackupStore>,
    state_root: Option<PathBuf>,
    cancel: CancelToken,
}

impl<'a> SyncOrchestrator<'a> {
    /// An orchestrator on the system clock with the tracker family's default
    /// rate limit. No backups and no sync state until configured.
    pub fn new(tracker: &'a dyn Tracker, options: SyncOptions) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
        let governor = Governor::new(
            TokenBucket::from_config(RateLimitConfig::for_tracker(tracker.name()), clock.clone()),
            RetryPolicy::from_config(&RetryConfig::default()),
            clock,
        );
        Self {
            tracker,
            matcher: Matcher::new(options.threshold).with_kind(options.similarity),
            options,
            governor,
            backups: None,
            state_root: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_governor(mut self, governor: Governor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_backups(mut self, store: BackupStore) -> Self {
        self.backups = Some(store);
        self
    }

    /// Root under which `state/<epic>.json` is read and written.
    pub fn with_state_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.state_root = Some(root.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Reconcile `epic` against the tracker.
    ///
    /// On success the epic carries the keys and hashes that were written
    /// back. `Err` means the run aborted before any tracker write.
    pub fn run(&self, epic: &mut Epic, writeback: &mut dyn Writeback) -> Result<SyncResult, SyncError> {
        let started = Instant::now();
        let mut result = SyncResult::new(&epic.key, self.options.dry_run);
        let tracker = GovernedTracker::new(self.tracker, &self.governor);

        let outcome = self.drive(&tracker, epic, writeback, &mut result);
        result.elapsed = started.elapsed();
        result.governor = self.governor.stats();

        match outcome {
            Ok(()) => {
                enter(&mut result, RunState::Done);
                tracing::info!(
                    epic = %epic.key,
                    created = result.counts.created,
                    updated = result.counts.updated,
                    failed = result.counts.failed,
                    conflicts = result.conflicts.len(),
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    exit = %result.exit_code(),
                    "sync finished"
                );
                Ok(result)
            }
            Err(err) => {
                enter(&mut result, RunState::Failed);
                tracing::error!(epic = %epic.key, error = %err, "sync aborted");
                Err(err)
            }
        }
    }

    fn drive(
        &self,
        tracker: &dyn Tracker,
        epic: &mut Epic,
        writeback: &mut dyn Writeback,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        enter(result, RunState::Init);
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.validate(epic)?;
        let children = tracker
            .fetch_epic_children(&epic.key)
            .map_err(SyncError::Connectivity)?;
        tracing::debug!(epic = %epic.key, issues = children.len(), "fetched epic children");

        enter(result, RunState::BackingUp);
        result.backup_id = self.back_up(&epic.key, &children)?;

        enter(result, RunState::Matching);
        let mut pass = self.match_stories(epic, &children, result);
        let mut state = self.load_state(&epic.key)?;
        if self.options.bidirectional {
            self.classify(epic, &state, &mut pass, result);
        }

        for phase in Phase::ordered(&self.options.phases) {
            if self.cancel.is_cancelled() {
                tracing::info!(%phase, "cancelled before phase");
                result.cancelled = true;
                pass.aborted = true;
                break;
            }
            enter(result, RunState::Planning(phase));
            let batch = self.plan_phase(phase, epic, &pass);

            enter(result, RunState::Executing(phase));
            let report = batch.execute(
                tracker,
                &BatchOptions {
                    parallelism: self.options.parallelism,
                    dry_run: self.options.dry_run,
                    cancel: self.cancel.clone(),
                },
            );
            self.absorb(report, tracker, epic, &mut pass, result);
            if pass.aborted {
                break;
            }
        }

        if self.options.bidirectional {
            enter(result, RunState::ConflictCheck);
            self.apply_pulls(epic, writeback, &mut pass, result);
        }

        enter(result, RunState::Reporting);
        if !self.options.dry_run && !pass.aborted {
            self.record(epic, writeback, tracker, &pass, &mut state, result);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Init
    // -----------------------------------------------------------------------

    fn validate(&self, epic: &Epic) -> Result<(), SyncError> {
        if epic.stories.is_empty() {
            return Err(SyncError::Validation(format!("epic {} has no stories", epic.key)));
        }
        check_document(epic).map_err(|e| SyncError::Validation(e.to_string()))?;

        let o = &self.options;
        if !(0.0..=1.0).contains(&o.threshold) {
            return Err(SyncError::Validation(format!(
                "match threshold must be within [0, 1], got {}",
                o.threshold
            )));
        }
        if o.parallelism == 0 {
            return Err(SyncError::Validation("parallelism must be at least 1".into()));
        }
        if o.phases.is_empty() {
            return Err(SyncError::Validation("no phases requested".into()));
        }

        let caps = self.tracker.capabilities();
        let mut missing: Vec<String> = Vec::new();
        for phase in Phase::ordered(&o.phases) {
            let supported = match phase {
                Phase::Descriptions => caps.update,
                Phase::Subtasks => caps.create && caps.update,
                Phase::Comments => caps.comment,
                Phase::Statuses => caps.transition,
            };
            if !supported {
                missing.push(phase.to_string());
            }
        }
        let needs_create = epic.stories.iter().any(|s| {
            s.external_key.is_none()
                || (o.phases.contains(&Phase::Subtasks)
                    && s.subtasks.iter().any(|sub| sub.external_key.is_none()))
        });
        if needs_create && !caps.create {
            missing.push("create".into());
        }
        if !missing.is_empty() {
            return Err(SyncError::Validation(format!(
                "tracker '{}' does not support: {}",
                self.tracker.name(),
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn back_up(&self, epic: &IssueKey, children: &[TrackerIssue]) -> Result<Option<BackupId>, SyncError> {
        if self.options.dry_run || !self.options.backup {
            tracing::debug!("backup skipped");
            return Ok(None);
        }
        let Some(store) = &self.backups else {
            tracing::debug!("no backup store configured");
            return Ok(None);
        };
        let backup = store.create(epic, children, &run_id()).map_err(|e| match e {
            SyncError::Backup(_) => e,
            other => SyncError::Backup(other.to_string()),
        })?;
        if let Some(keep) = self.options.keep_backups {
            match store.prune(epic, keep) {
                Ok(removed) if !removed.is_empty() => {
                    tracing::debug!(removed = removed.len(), keep, "pruned old backups")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "backup pruning failed"),
            }
        }
        Ok(Some(backup.id))
    }

    fn load_state(&self, epic: &IssueKey) -> Result<SyncStateFile, SyncError> {
        match &self.state_root {
            Some(root) => sync_state::load_at(root, epic),
            None => Ok(SyncStateFile::empty(epic)),
        }
    }

    // -----------------------------------------------------------------------
    // Matching + classification
    // -----------------------------------------------------------------------

    fn match_stories(&self, epic: &mut Epic, children: &[TrackerIssue], result: &mut SyncResult) -> Pass {
        let matches = self.matcher.match_stories(&epic.stories, children);
        let mut pass = Pass::default();
        for m in &matches {
            let Some(issue) = m
                .issue
                .as_ref()
                .and_then(|key| children.iter().find(|i| &i.key == key))
            else {
                tracing::debug!(story = %m.story, "unmatched");
                continue;
            };
            tracing::debug!(
                story = %m.story,
                issue = %issue.key,
                method = %m.method,
                confidence = m.confidence,
                "matched"
            );
            if !self.options.dry_run {
                if let Some(story) = epic.story_mut(&m.story) {
                    story.external_key = Some(issue.key.clone());
                    if story.external_url.is_none() {
                        story.external_url = issue.url.clone();
                    }
                }
            }
            pass.issues.insert(m.story.clone(), issue.clone());
        }
        result.counts.matched = pass.issues.len();
        result.matches = matches;
        pass
    }

    fn classify(&self, epic: &Epic, state: &SyncStateFile, pass: &mut Pass, result: &mut SyncResult) {
        for story in &epic.stories {
            let Some(issue) = pass.issues.get(&story.id) else {
                continue;
            };
            let decision = conflict::resolve(
                story,
                issue,
                state.story(&story.id),
                self.options.conflict_strategy,
            );
            tracing::debug!(story = %story.id, state = ?decision.state, "classified");

            if !decision.push {
                pass.excluded.insert(story.id.clone());
                result.counts.skipped += 1;
            }
            if let Some(fields) = &decision.push_fields {
                let mut merged = story.clone();
                conflict::apply_fields(&mut merged, fields);
                pass.overrides.insert(story.id.clone(), merged);
            }
            if let Some(fields) = decision.pull {
                pass.pulls.push(PulledChange {
                    story: story.id.clone(),
                    issue: issue.key.clone(),
                    fields,
                });
            }
            if let Some(record) = decision.conflict {
                if record.resolution == Resolution::Unresolved {
                    tracing::warn!(story = %story.id, issue = %issue.key, "conflict left unresolved");
                    pass.unresolved.insert(story.id.clone());
                }
                result.conflicts.push(record);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Planning + execution
    // -----------------------------------------------------------------------

    fn plan_phase(&self, phase: Phase, epic: &Epic, pass: &Pass) -> CommandBatch {
        let planner = Planner::new(&epic.key, &self.options.phases, &self.matcher);
        let mut commands = Vec::new();
        for story in &epic.stories {
            if pass.excluded.contains(&story.id) {
                continue;
            }
            let story = pass.overrides.get(&story.id).unwrap_or(story);
            commands.extend(planner.plan(phase, story, pass.issues.get(&story.id)));
        }
        tracing::debug!(%phase, commands = commands.len(), "planned");
        CommandBatch::new(commands, self.options.mode)
    }

    fn absorb(
        &self,
        report: BatchReport,
        tracker: &dyn Tracker,
        epic: &mut Epic,
        pass: &mut Pass,
        result: &mut SyncResult,
    ) {
        result.attempted += report.attempted();
        result.counts.failed += report.failed.len() + report.rollback_failures.len();
        result.counts.skipped += report.skipped.len();
        result.cancelled |= report.cancelled;
        pass.incomplete.extend(report.incomplete_stories());
        if self.options.dry_run {
            result.previews.extend(report.previews());
        }

        let failures = report
            .failed
            .iter()
            .map(|f| (f, ErrorKind::Command))
            .chain(report.rollback_failures.iter().map(|f| (f, ErrorKind::Rollback)));
        for (failed, kind) in failures {
            result.errors.push(ErrorDescriptor {
                story: Some(failed.command.story().clone()),
                command: Some(failed.command.kind().to_string()),
                kind,
                message: failed.error.to_string(),
            });
        }

        let mut refresh: Vec<StoryId> = Vec::new();
        for done in &report.executed {
            let story = done.command.story().clone();
            if done.command.is_create() {
                result.counts.created += 1;
            } else {
                result.counts.updated += 1;
            }
            pass.touched.insert(story.clone());
            match &done.command {
                Command::CreateStory { .. } => {
                    if self.options.dry_run {
                        if let Some(local) = epic.story(&story) {
                            pass.issues.insert(story.clone(), placeholder_story(local, &done.outcome));
                        }
                    } else {
                        if let Some(local) = epic.story_mut(&story) {
                            local.external_key = Some(done.outcome.key.clone());
                            local.external_url = done.outcome.url.clone();
                        }
                        refresh.push(story);
                    }
                }
                Command::CreateSubtask { subtask, .. } => {
                    if self.options.dry_run {
                        let local = epic
                            .story(&story)
                            .and_then(|s| s.subtasks.iter().find(|sub| &sub.id == subtask));
                        if let (Some(local), Some(issue)) = (local, pass.issues.get_mut(&story)) {
                            issue.subtasks.push(TrackerIssue {
                                key: done.outcome.key.clone(),
                                summary: local.title.trim().to_string(),
                                description: local.description.trim().to_string(),
                                status: Status::Open,
                                priority: None,
                                story_points: None,
                                subtasks: vec![],
                                comments: vec![],
                                url: None,
                                updated: String::new(),
                            });
                        }
                    } else {
                        if let Some(local) = epic
                            .story_mut(&story)
                            .and_then(|s| s.subtasks.iter_mut().find(|sub| &sub.id == subtask))
                        {
                            local.external_key = Some(done.outcome.key.clone());
                        }
                        refresh.push(story);
                    }
                }
                _ => {}
            }
        }

        if report.cancelled {
            pass.aborted = true;
        }
        if self.options.mode == ExecutionMode::Transactional && !report.failed.is_empty() {
            tracing::warn!(rolled_back = report.rolled_back.len(), "batch rolled back, stopping");
            pass.aborted = true;
        }

        refresh.sort();
        refresh.dedup();
        for story in refresh {
            let Some(key) = epic.story(&story).and_then(|s| s.external_key.clone()) else {
                continue;
            };
            match tracker.fetch_issue(&key) {
                Ok(issue) => {
                    pass.issues.insert(story, issue);
                }
                Err(e) => {
                    tracing::warn!(story = %story, issue = %key, error = %e, "re-fetch after create failed");
                    result.errors.push(ErrorDescriptor {
                        story: Some(story.clone()),
                        command: Some("fetch_issue".into()),
                        kind: ErrorKind::Command,
                        message: e.to_string(),
                    });
                    pass.incomplete.insert(story);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // ConflictCheck + Reporting
    // -----------------------------------------------------------------------

    fn apply_pulls(
        &self,
        epic: &mut Epic,
        writeback: &mut dyn Writeback,
        pass: &mut Pass,
        result: &mut SyncResult,
    ) {
        for pull in std::mem::take(&mut pass.pulls) {
            if !self.options.dry_run && !pass.aborted {
                if let Some(story) = epic.story_mut(&pull.story) {
                    conflict::apply_fields(story, &pull.fields);
                }
                if let Err(e) = writeback.apply_remote(&pull.story, &pull.fields) {
                    tracing::warn!(story = %pull.story, error = %e, "remote values not written back");
                    result.errors.push(ErrorDescriptor {
                        story: Some(pull.story.clone()),
                        command: None,
                        kind: ErrorKind::Writeback,
                        message: e.to_string(),
                    });
                    pass.incomplete.insert(pull.story.clone());
                }
            }
            result.pulled.push(pull);
        }
    }

    /// Write back and record every story whose commands all went through.
    fn record(
        &self,
        epic: &mut Epic,
        writeback: &mut dyn Writeback,
        tracker: &dyn Tracker,
        pass: &Pass,
        state: &mut SyncStateFile,
        result: &mut SyncResult,
    ) {
        let mut synced = 0usize;
        for story in epic.stories.iter_mut() {
            if pass.incomplete.contains(&story.id) || pass.unresolved.contains(&story.id) {
                continue;
            }
            let Some(key) = story.external_key.clone() else {
                continue;
            };

            let remote = if pass.touched.contains(&story.id) {
                match tracker.fetch_issue(&key) {
                    Ok(issue) => Some(issue),
                    Err(e) => {
                        tracing::warn!(story = %story.id, error = %e, "remote marker refresh failed");
                        result.errors.push(ErrorDescriptor {
                            story: Some(story.id.clone()),
                            command: Some("fetch_issue".into()),
                            kind: ErrorKind::State,
                            message: e.to_string(),
                        });
                        None
                    }
                }
            } else {
                pass.issues.get(&story.id).cloned()
            };

            if let Some(issue) = &remote {
                let matches = self.matcher.match_subtasks(&story.subtasks, &issue.subtasks);
                for (sub, m) in story.subtasks.iter_mut().zip(matches) {
                    if let Some(k) = m.issue {
                        sub.external_key = Some(k);
                    }
                }
            }

            let hash = story_hash(story);
            story.last_synced_hash = Some(hash.clone());
            let mut written = writeback
                .update_source(&story.id, &key, story.external_url.as_deref(), &hash);
            for sub in &story.subtasks {
                if let Some(sub_key) = &sub.external_key {
                    if let Err(e) = writeback.update_subtask_source(&story.id, &sub.id, sub_key) {
                        written = Err(e);
                    }
                }
            }
            if let Err(e) = written {
                tracing::warn!(story = %story.id, error = %e, "writeback failed");
                result.errors.push(ErrorDescriptor {
                    story: Some(story.id.clone()),
                    command: None,
                    kind: ErrorKind::Writeback,
                    message: e.to_string(),
                });
            }

            if let Some(issue) = remote {
                state.stories.insert(
                    story.id.clone(),
                    StoryState {
                        issue_key: key,
                        local_hash: hash,
                        remote_updated: issue.updated,
                    },
                );
            }
            synced += 1;
        }

        if let Err(e) = writeback.flush() {
            tracing::warn!(error = %e, "writeback flush failed");
            result.errors.push(ErrorDescriptor {
                story: None,
                command: None,
                kind: ErrorKind::Writeback,
                message: e.to_string(),
            });
        }

        if let Some(root) = &self.state_root {
            state.synced_at = Utc::now();
            if let Err(e) = sync_state::save_at(root, state) {
                tracing::warn!(error = %e, "sync state not saved");
                result.errors.push(ErrorDescriptor {
                    story: None,
                    command: None,
                    kind: ErrorKind::State,
                    message: e.to_string(),
                });
            }
        }
        tracing::info!(synced, "sync recorded");
    }
}

fn enter(result: &mut SyncResult, state: RunState) {
    tracing::info!(epic = %result.epic, state = %state, "sync state");
    result.states.push(state);
}

/// Six hex digits; keeps backups of one second apart.
fn run_id() -> String {
    format!("{:06x}", rand::random::<u32>() & 0x00ff_ffff)
}

/// What a dry run assumes a freshly created story looks like.
fn placeholder_story(story: &Story, outcome: &CommandOutcome) -> TrackerIssue {
    TrackerIssue {
        key: outcome.key.clone(),
        summary: story.title.trim().to_string(),
        description: story.description.render(),
        status: Status::Open,
        priority: Some(story.priority),
        story_points: story.story_points,
        subtasks: vec![],
        comments: vec![],
        url: None,
        updated: String::new(),
    }
}
