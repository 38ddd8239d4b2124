//! Batch execution of planned commands.
//!
//! A batch is split into lanes, one per story, in plan order. Lanes run on a
//! bounded pool of scoped threads; the commands of one lane run in order on
//! one worker, which keeps a story ahead of its subtasks. Cancellation is
//! checked between commands, never inside one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use epicsync_core::error::TrackerError;
use epicsync_core::tracker::Tracker;
use epicsync_core::types::StoryId;

use crate::command::{Command, CommandOutcome, LaneKeys};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Continue past failures and aggregate them.
    #[default]
    BestEffort,
    /// Stop at the first failure and undo everything already executed.
    Transactional,
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub parallelism: usize,
    pub dry_run: bool,
    pub cancel: CancelToken,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            dry_run: false,
            cancel: CancelToken::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedCommand {
    pub command: Command,
    pub outcome: CommandOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedCommand {
    pub command: Command,
    pub error: TrackerError,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Succeeded (or, in a dry run, previewed) commands.
    pub executed: Vec<ExecutedCommand>,
    pub failed: Vec<FailedCommand>,
    /// Never attempted: cancelled, blocked on a failed create, or cut off by
    /// a transactional abort.
    pub skipped: Vec<Command>,
    /// Executed and then undone by a transactional abort.
    pub rolled_back: Vec<ExecutedCommand>,
    pub rollback_failures: Vec<FailedCommand>,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl BatchReport {
    /// Commands that reached the tracker.
    pub fn attempted(&self) -> usize {
        self.executed.len() + self.failed.len() + self.rolled_back.len()
            + self.rollback_failures.len()
    }

    pub fn previews(&self) -> Vec<String> {
        self.executed.iter().map(|e| e.command.preview()).collect()
    }

    /// Stories with at least one failed, skipped or rolled-back command.
    pub fn incomplete_stories(&self) -> HashSet<StoryId> {
        self.failed
            .iter()
            .map(|f| f.command.story())
            .chain(self.skipped.iter().map(Command::story))
            .chain(self.rolled_back.iter().map(|e| e.command.story()))
            .chain(self.rollback_failures.iter().map(|f| f.command.story()))
            .cloned()
            .collect()
    }

    fn absorb(&mut self, lane: BatchReport) {
        self.executed.extend(lane.executed);
        self.failed.extend(lane.failed);
        self.skipped.extend(lane.skipped);
        self.cancelled |= lane.cancelled;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBatch {
    commands: Vec<Command>,
    mode: ExecutionMode,
}

impl CommandBatch {
    pub fn new(commands: Vec<Command>, mode: ExecutionMode) -> Self {
        Self { commands, mode }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn preview(&self) -> Vec<String> {
        self.commands.iter().map(Command::preview).collect()
    }

    /// Commands grouped by story, lanes in order of first appearance.
    pub fn lanes(&self) -> Vec<Vec<&Command>> {
        let mut order: Vec<&StoryId> = Vec::new();
        let mut lanes: Vec<Vec<&Command>> = Vec::new();
        for cmd in &self.commands {
            match order.iter().position(|s| *s == cmd.story()) {
                Some(i) => lanes[i].push(cmd),
                None => {
                    order.push(cmd.story());
                    lanes.push(vec![cmd]);
                }
            }
        }
        lanes
    }

    pub fn execute(&self, tracker: &dyn Tracker, options: &BatchOptions) -> BatchReport {
        if self.mode == ExecutionMode::Transactional && !options.dry_run {
            return self.execute_transactional(tracker, options);
        }

        let lanes = self.lanes();
        let workers = options.parallelism.max(1).min(lanes.len());
        let mut report = BatchReport {
            dry_run: options.dry_run,
            ..BatchReport::default()
        };

        if workers <= 1 {
            for lane in &lanes {
                report.absorb(run_lane(lane, tracker, options));
            }
            return report;
        }

        let next = AtomicUsize::new(0);
        let done: Mutex<Vec<(usize, BatchReport)>> = Mutex::new(Vec::with_capacity(lanes.len()));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(lane) = lanes.get(i) else { break };
                    let lane_report = run_lane(lane, tracker, options);
                    done.lock().push((i, lane_report));
                });
            }
        });

        let mut done = done.into_inner();
        done.sort_by_key(|(i, _)| *i);
        for (_, lane_report) in done {
            report.absorb(lane_report);
        }
        report
    }

    fn execute_transactional(&self, tracker: &dyn Tracker, options: &BatchOptions) -> BatchReport {
        let mut report = BatchReport::default();
        let mut keys = LaneKeys::default();
        let mut done: Vec<ExecutedCommand> = Vec::new();

        for (i, cmd) in self.commands.iter().enumerate() {
            if options.cancel.is_cancelled() {
                tracing::info!(remaining = self.commands.len() - i, "cancelled, rolling back");
                report.cancelled = true;
                report.skipped.extend(self.commands[i..].iter().cloned());
                rollback(done, tracker, &mut report);
                return report;
            }
            tracing::debug!(story = %cmd.story(), command = cmd.kind(), "executing");
            match cmd.execute(tracker, &mut keys) {
                Ok(outcome) => done.push(ExecutedCommand {
                    command: cmd.clone(),
                    outcome,
                }),
                Err(error) => {
                    tracing::warn!(
                        story = %cmd.story(),
                        command = cmd.kind(),
                        error = %error,
                        "command failed, rolling back batch"
                    );
                    report.failed.push(FailedCommand {
                        command: cmd.clone(),
                        error,
                    });
                    report.skipped.extend(self.commands[i + 1..].iter().cloned());
                    rollback(done, tracker, &mut report);
                    return report;
                }
            }
        }
        report.executed = done;
        report
    }
}

/// Undo in reverse execution order.
fn rollback(done: Vec<ExecutedCommand>, tracker: &dyn Tracker, report: &mut BatchReport) {
    for executed in done.into_iter().rev() {
        match executed.command.undo(tracker, &executed.outcome) {
            Ok(()) => report.rolled_back.push(executed),
            Err(error) => {
                tracing::error!(
                    command = executed.command.kind(),
                    key = %executed.outcome.key,
                    error = %error,
                    "undo failed"
                );
                report.rollback_failures.push(FailedCommand {
                    command: executed.command,
                    error,
                });
            }
        }
    }
}

/// A command waiting on a create that never happened.
fn blocked(cmd: &Command, keys: &LaneKeys) -> bool {
    !matches!(cmd, Command::CreateStory { .. }) && keys.resolve(&cmd.target()).is_none()
}

fn run_lane(lane: &[&Command], tracker: &dyn Tracker, options: &BatchOptions) -> BatchReport {
    let mut report = BatchReport::default();
    let mut keys = LaneKeys::default();

    for (i, cmd) in lane.iter().enumerate() {
        if options.cancel.is_cancelled() {
            report.cancelled = true;
            report.skipped.extend(lane[i..].iter().map(|c| (*c).clone()));
            break;
        }
        if options.dry_run {
            let outcome = cmd.simulate(&mut keys);
            tracing::info!(story = %cmd.story(), "[dry-run] {}", cmd.preview());
            report.executed.push(ExecutedCommand {
                command: (*cmd).clone(),
                outcome,
            });
            continue;
        }
        if blocked(cmd, &keys) {
            tracing::debug!(story = %cmd.story(), command = cmd.kind(), "skipped: target not created");
            report.skipped.push((*cmd).clone());
            continue;
        }
        tracing::debug!(story = %cmd.story(), command = cmd.kind(), "executing");
        match cmd.execute(tracker, &mut keys) {
            Ok(outcome) => report.executed.push(ExecutedCommand {
                command: (*cmd).clone(),
                outcome,
            }),
            Err(error) => {
                tracing::warn!(
                    story = %cmd.story(),
                    command = cmd.kind(),
                    error = %error,
                    "command failed"
                );
                report.failed.push(FailedCommand {
                    command: (*cmd).clone(),
                    error,
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::IssueRef;
    use epicsync_core::issue::NewIssue;
    use epicsync_core::types::{IssueKey, Status};
    use epicsync_core::MemoryTracker;

    fn new_issue(summary: &str, hint: &str) -> NewIssue {
        NewIssue {
            summary: summary.into(),
            description: String::new(),
            priority: None,
            story_points: None,
            idempotency_key: hint.into(),
        }
    }

    fn create_with_subtask(story: &str) -> Vec<Command> {
        let id = StoryId::from(story);
        vec![
            Command::CreateStory {
                story: id.clone(),
                epic: IssueKey::from("PROJ-100"),
                data: new_issue(story, story),
            },
            Command::CreateSubtask {
                story: id.clone(),
                subtask: StoryId::from("ST-1"),
                parent: IssueRef::pending_story(&id),
                data: new_issue("sub", &format!("{story}/ST-1")),
            },
        ]
    }

    #[test]
    fn lanes_group_by_story_in_first_seen_order() {
        let mut commands = create_with_subtask("US-2");
        commands.extend(create_with_subtask("US-1"));
        let batch = CommandBatch::new(commands, ExecutionMode::BestEffort);
        let lanes = batch.lanes();
        assert_eq!(lanes.len(), 2);
        assert_eq!(lanes[0][0].story(), &StoryId::from("US-2"));
        assert_eq!(lanes[1].len(), 2);
    }

    #[test]
    fn parallel_lanes_all_complete() {
        let tracker = MemoryTracker::new("PROJ");
        let mut commands = Vec::new();
        for i in 0..12 {
            commands.extend(create_with_subtask(&format!("US-{i}")));
        }
        let batch = CommandBatch::new(commands, ExecutionMode::BestEffort);
        let report = batch.execute(&tracker, &BatchOptions::default());
        assert_eq!(report.executed.len(), 24);
        assert!(report.failed.is_empty());
        let children = tracker.fetch_epic_children(&IssueKey::from("PROJ-100")).unwrap();
        assert_eq!(children.len(), 12);
        assert!(children.iter().all(|c| c.subtasks.len() == 1));
    }

    #[test]
    fn failed_create_skips_dependents_only() {
        let tracker = MemoryTracker::new("PROJ");
        tracker.fail_next("create_story", TrackerError::api(400, "bad summary"));
        let batch = CommandBatch::new(create_with_subtask("US-1"), ExecutionMode::BestEffort);
        let report = batch.execute(
            &tracker,
            &BatchOptions {
                parallelism: 1,
                ..BatchOptions::default()
            },
        );
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(tracker.calls("create_subtask"), 0);
        assert!(report.incomplete_stories().contains(&StoryId::from("US-1")));
    }

    #[test]
    fn dry_run_touches_nothing() {
        let tracker = MemoryTracker::new("PROJ");
        let batch = CommandBatch::new(create_with_subtask("US-1"), ExecutionMode::Transactional);
        let report = batch.execute(
            &tracker,
            &BatchOptions {
                dry_run: true,
                ..BatchOptions::default()
            },
        );
        assert_eq!(tracker.total_calls(), 0);
        assert_eq!(report.previews().len(), 2);
        assert_eq!(report.executed[1].outcome.key, IssueKey::from("PENDING-US-1/ST-1"));
    }

    #[test]
    fn cancelled_token_stops_before_first_command() {
        let tracker = MemoryTracker::new("PROJ");
        let cancel = CancelToken::new();
        cancel.cancel();
        let batch = CommandBatch::new(create_with_subtask("US-1"), ExecutionMode::BestEffort);
        let report = batch.execute(
            &tracker,
            &BatchOptions {
                cancel,
                ..BatchOptions::default()
            },
        );
        assert!(report.cancelled);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(tracker.total_calls(), 0);
    }

    #[test]
    fn transactional_failure_rolls_back_in_reverse() {
        let tracker = MemoryTracker::new("PROJ");
        let mut commands = create_with_subtask("US-1");
        commands.push(Command::TransitionStatus {
            story: StoryId::from("US-1"),
            subtask: None,
            target: IssueRef::pending_story(&StoryId::from("US-1")),
            before: Status::Open,
            after: Status::Done,
        });
        tracker.fail_next("transition_status", TrackerError::Permission("workflow".into()));

        let batch = CommandBatch::new(commands, ExecutionMode::Transactional);
        let report = batch.execute(&tracker, &BatchOptions::default());

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.rolled_back.len(), 2);
        assert_eq!(report.rolled_back[0].command.kind(), "create_subtask");
        assert!(report.executed.is_empty());
        assert!(tracker
            .fetch_epic_children(&IssueKey::from("PROJ-100"))
            .unwrap()
            .is_empty());
    }
}
