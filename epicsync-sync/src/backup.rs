//! Pre-sync snapshots, restore, and diff-against-backup.
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//!   backups/
//!     <epic>_<UTC timestamp>_<run suffix>.json
//! ```
//!
//! A backup is written once (`.tmp` then hard-linked into place, which fails
//! rather than replacing an existing file) and never modified afterwards.
//! Restore does not write anything itself: it plans ordinary commands from
//! current state back to the snapshot and runs them through
//! [`CommandBatch`]. Subtasks and comments that appeared after the backup
//! are deleted; ones that disappeared are reported by `diff` only.

use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;

use epicsync_core::error::TrackerError;
use epicsync_core::issue::{NewIssue, TrackerComment, TrackerIssue};
use epicsync_core::tracker::Tracker;
use epicsync_core::types::{IssueKey, Priority, Status, StoryId};

use crate::batch::{BatchOptions, BatchReport, CommandBatch, ExecutionMode};
use crate::command::{Command, IssueRef};
use crate::error::{io_err, json_err, SyncError};
use crate::hash::normalize_text;
use crate::sync_state::file_stem;

/// Opaque backup identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(pub String);

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BackupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Field values of one issue at backup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub key: IssueKey,
    pub summary: String,
    pub description: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<IssueSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<TrackerComment>,
}

impl IssueSnapshot {
    pub fn of(issue: &TrackerIssue) -> Self {
        Self {
            key: issue.key.clone(),
            summary: issue.summary.clone(),
            description: issue.description.clone(),
            status: issue.status,
            priority: issue.priority,
            story_points: issue.story_points,
            subtasks: issue.subtasks.iter().map(IssueSnapshot::of).collect(),
            comments: issue.comments.clone(),
        }
    }

    fn has_subtask(&self, key: &IssueKey) -> bool {
        self.subtasks.iter().any(|s| &s.key == key)
    }

    fn has_comment(&self, id: &str) -> bool {
        self.comments.iter().any(|c| c.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    pub epic: IssueKey,
    pub created_at: DateTime<Utc>,
    pub issues: Vec<IssueSnapshot>,
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub id: BackupId,
    pub epic: IssueKey,
    pub created_at: DateTime<Utc>,
    pub issue_count: usize,
}

/// One field whose current tracker value differs from the backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub issue: IssueKey,
    pub field: String,
    /// Value in the backup.
    pub backup: String,
    /// Value on the tracker now; `<missing>` if the issue is gone.
    pub current: String,
}

impl FieldChange {
    /// Unified diff from backup to current.
    pub fn unified_diff(&self) -> String {
        let old_header = format!("backup/{}/{}", self.issue, self.field);
        let new_header = format!("current/{}/{}", self.issue, self.field);
        TextDiff::from_lines(&with_newline(&self.backup), &with_newline(&self.current))
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string()
    }
}

fn with_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

fn opt_display<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(String::new, |v| v.to_string())
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    /// Store under `<root>/backups`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// `<root>/backups/<id>.json`: pure, no I/O.
    pub fn path_of(&self, id: &BackupId) -> PathBuf {
        self.dir().join(format!("{id}.json"))
    }

    /// Snapshot `issues` (with their subtasks) for `epic`.
    pub fn create(
        &self,
        epic: &IssueKey,
        issues: &[TrackerIssue],
        run: &str,
    ) -> Result<Backup, SyncError> {
        let created_at = Utc::now();
        let id = BackupId(format!(
            "{}_{}_{}",
            file_stem(epic),
            created_at.format("%Y%m%dT%H%M%S%3fZ"),
            run
        ));
        let backup = Backup {
            id,
            epic: epic.clone(),
            created_at,
            issues: issues.iter().map(IssueSnapshot::of).collect(),
        };

        self.write_new(&backup)?;
        tracing::info!(backup = %backup.id, issues = backup.issues.len(), "backup written");
        Ok(backup)
    }

    /// Write `backup` under its id; fails if that id is already taken.
    fn write_new(&self, backup: &Backup) -> Result<(), SyncError> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = self.path_of(&backup.id);
        let tmp = dir.join(format!("{}.json.tmp", backup.id));
        let json = serde_json::to_string_pretty(backup).map_err(|e| json_err(&path, e))?;
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        let linked = std::fs::hard_link(&tmp, &path);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(SyncError::Backup(format!(
                "backup {} already exists; refusing to overwrite",
                backup.id
            ))),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    pub fn load(&self, id: &BackupId) -> Result<Backup, SyncError> {
        let path = self.path_of(id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SyncError::BackupNotFound(id.0.clone()))
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        serde_json::from_str(&contents).map_err(|e| json_err(&path, e))
    }

    /// Backups, newest first; all epics when `epic` is `None`.
    pub fn list(&self, epic: Option<&IssueKey>) -> Result<Vec<BackupSummary>, SyncError> {
        let dir = self.dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir, e)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            let backup: Backup = match serde_json::from_str(&contents) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable backup");
                    continue;
                }
            };
            if epic.is_some_and(|k| k != &backup.epic) {
                continue;
            }
            out.push(BackupSummary {
                issue_count: backup.issues.len(),
                id: backup.id,
                epic: backup.epic,
                created_at: backup.created_at,
            });
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    /// Delete all but the `keep` newest backups of `epic`. Returns the
    /// removed ids.
    pub fn prune(&self, epic: &IssueKey, keep: usize) -> Result<Vec<BackupId>, SyncError> {
        let mut removed = Vec::new();
        for summary in self.list(Some(epic))?.into_iter().skip(keep) {
            let path = self.path_of(&summary.id);
            std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            tracing::debug!(backup = %summary.id, "pruned backup");
            removed.push(summary.id);
        }
        Ok(removed)
    }

    /// Commands that move the tracker from its current state back to the
    /// snapshot. Issues that no longer exist are skipped; subtasks and
    /// comments added since are deleted.
    pub fn plan_restore(
        &self,
        id: &BackupId,
        tracker: &dyn Tracker,
    ) -> Result<CommandBatch, SyncError> {
        let backup = self.load(id)?;
        let mut batch = CommandBatch::new(Vec::new(), ExecutionMode::BestEffort);
        for snapshot in &backup.issues {
            let Some(current) = fetch_existing(tracker, &snapshot.key)? else {
                tracing::warn!(issue = %snapshot.key, "issue no longer exists; not restored");
                continue;
            };
            let lane = StoryId(snapshot.key.0.clone());
            let target = IssueRef::Key(current.key.clone());

            if normalize_text(&current.description) != normalize_text(&snapshot.description) {
                batch.push(Command::UpdateDescription {
                    story: lane.clone(),
                    target: target.clone(),
                    before: current.description.clone(),
                    after: snapshot.description.clone(),
                });
            }
            if current.story_points != snapshot.story_points {
                batch.push(Command::UpdateStoryPoints {
                    story: lane.clone(),
                    target: target.clone(),
                    before: current.story_points,
                    after: snapshot.story_points,
                });
            }
            if current.status != snapshot.status {
                batch.push(Command::TransitionStatus {
                    story: lane.clone(),
                    subtask: None,
                    target: target.clone(),
                    before: current.status,
                    after: snapshot.status,
                });
            }
            for sub_snap in &snapshot.subtasks {
                let Some(sub) = current.subtask(&sub_snap.key) else {
                    continue;
                };
                let sub_id = StoryId(sub.key.0.clone());
                let sub_target = IssueRef::Key(sub.key.clone());
                if normalize_text(&sub.description) != normalize_text(&sub_snap.description) {
                    batch.push(Command::UpdateSubtask {
                        story: lane.clone(),
                        subtask: sub_id.clone(),
                        target: sub_target.clone(),
                        before: sub.description.clone(),
                        after: sub_snap.description.clone(),
                    });
                }
                if sub.status != sub_snap.status {
                    batch.push(Command::TransitionStatus {
                        story: lane.clone(),
                        subtask: Some(sub_id),
                        target: sub_target.clone(),
                        before: sub.status,
                        after: sub_snap.status,
                    });
                }
                push_comment_deletes(&mut batch, &lane, &sub_target, sub_snap, sub);
            }
            for added in current.subtasks.iter().filter(|s| !snapshot.has_subtask(&s.key)) {
                batch.push(Command::DeleteSubtask {
                    story: lane.clone(),
                    subtask: StoryId(added.key.0.clone()),
                    parent: current.key.clone(),
                    target: IssueRef::Key(added.key.clone()),
                    data: NewIssue {
                        summary: added.summary.clone(),
                        description: added.description.clone(),
                        priority: added.priority,
                        story_points: added.story_points,
                        idempotency_key: format!("{}/{}", current.key, added.key),
                    },
                });
            }
            push_comment_deletes(&mut batch, &lane, &target, snapshot, &current);
        }
        Ok(batch)
    }

    /// Plan and run a restore.
    pub fn restore(
        &self,
        id: &BackupId,
        tracker: &dyn Tracker,
        options: &BatchOptions,
    ) -> Result<BatchReport, SyncError> {
        let batch = self.plan_restore(id, tracker)?;
        tracing::info!(backup = %id, commands = batch.len(), "restoring backup");
        Ok(batch.execute(tracker, options))
    }

    /// Field-level differences between the snapshot and the tracker now.
    /// Read-only.
    pub fn diff(&self, id: &BackupId, tracker: &dyn Tracker) -> Result<Vec<FieldChange>, SyncError> {
        let backup = self.load(id)?;
        let mut changes = Vec::new();
        for snapshot in &backup.issues {
            match fetch_existing(tracker, &snapshot.key)? {
                Some(current) => diff_issue(snapshot, &IssueSnapshot::of(&current), &mut changes),
                None => changes.push(FieldChange {
                    issue: snapshot.key.clone(),
                    field: "issue".into(),
                    backup: snapshot.summary.clone(),
                    current: "<missing>".into(),
                }),
            }
        }
        Ok(changes)
    }
}

fn fetch_existing(tracker: &dyn Tracker, key: &IssueKey) -> Result<Option<TrackerIssue>, SyncError> {
    match tracker.fetch_issue(key) {
        Ok(issue) => Ok(Some(issue)),
        Err(TrackerError::Api { status: 404, .. }) => Ok(None),
        Err(e) => Err(SyncError::Tracker(e)),
    }
}

fn push_comment_deletes(
    batch: &mut CommandBatch,
    lane: &StoryId,
    target: &IssueRef,
    snapshot: &IssueSnapshot,
    current: &TrackerIssue,
) {
    for added in current.comments.iter().filter(|c| !snapshot.has_comment(&c.id)) {
        batch.push(Command::DeleteComment {
            story: lane.clone(),
            target: target.clone(),
            comment_id: added.id.clone(),
            body: added.body.clone(),
        });
    }
}

fn diff_issue(snap: &IssueSnapshot, now: &IssueSnapshot, out: &mut Vec<FieldChange>) {
    let mut push = |field: &str, backup: String, current: String| {
        if backup != current {
            out.push(FieldChange {
                issue: snap.key.clone(),
                field: field.to_string(),
                backup,
                current,
            });
        }
    };
    push("summary", snap.summary.clone(), now.summary.clone());
    push(
        "description",
        normalize_text(&snap.description),
        normalize_text(&now.description),
    );
    push("status", snap.status.to_string(), now.status.to_string());
    push("priority", opt_display(snap.priority), opt_display(now.priority));
    push(
        "story_points",
        opt_display(snap.story_points),
        opt_display(now.story_points),
    );
    for sub in &snap.subtasks {
        match now.subtasks.iter().find(|s| s.key == sub.key) {
            Some(current) => diff_issue(sub, current, out),
            None => out.push(FieldChange {
                issue: sub.key.clone(),
                field: "issue".into(),
                backup: sub.summary.clone(),
                current: "<missing>".into(),
            }),
        }
    }
    for sub in now.subtasks.iter().filter(|s| !snap.has_subtask(&s.key)) {
        out.push(FieldChange {
            issue: sub.key.clone(),
            field: "issue".into(),
            backup: "<absent>".into(),
            current: sub.summary.clone(),
        });
    }
    for comment in &snap.comments {
        if !now.has_comment(&comment.id) {
            out.push(comment_change(&snap.key, comment, comment.body.clone(), "<missing>".into()));
        }
    }
    for comment in now.comments.iter().filter(|c| !snap.has_comment(&c.id)) {
        out.push(comment_change(&snap.key, comment, "<absent>".into(), comment.body.clone()));
    }
}

fn comment_change(
    issue: &IssueKey,
    comment: &TrackerComment,
    backup: String,
    current: String,
) -> FieldChange {
    FieldChange {
        issue: issue.clone(),
        field: format!("comment {}", comment.id),
        backup,
        current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epicsync_core::MemoryTracker;
    use tempfile::TempDir;

    fn seeded() -> (MemoryTracker, IssueKey) {
        let tracker = MemoryTracker::new("PROJ");
        let epic = IssueKey::from("PROJ-100");
        tracker.seed(
            &epic,
            TrackerIssue {
                key: IssueKey::from("PROJ-1"),
                summary: "Login".into(),
                description: "old text".into(),
                status: Status::Open,
                priority: Some(Priority::High),
                story_points: Some(3),
                subtasks: vec![],
                comments: vec![],
                url: None,
                updated: String::new(),
            },
        );
        (tracker, epic)
    }

    #[test]
    fn create_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path());
        let (tracker, epic) = seeded();
        let issues = tracker.fetch_epic_children(&epic).unwrap();

        let backup = store.create(&epic, &issues, "abc123").unwrap();
        assert!(backup.id.0.starts_with("PROJ-100_"));
        assert!(backup.id.0.ends_with("_abc123"));
        assert_eq!(store.load(&backup.id).unwrap(), backup);
        assert!(!store.dir().join(format!("{}.json.tmp", backup.id)).exists());
    }

    #[test]
    fn existing_backup_is_never_overwritten() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path());
        let (tracker, epic) = seeded();
        let backup = store
            .create(&epic, &tracker.fetch_epic_children(&epic).unwrap(), "run")
            .unwrap();
        let original = std::fs::read(store.path_of(&backup.id)).unwrap();

        let mut clash = backup.clone();
        clash.issues.clear();
        let err = store.write_new(&clash).unwrap_err();

        assert!(matches!(err, SyncError::Backup(_)), "got: {err}");
        assert_eq!(std::fs::read(store.path_of(&backup.id)).unwrap(), original);
    }

    #[test]
    fn missing_backup_is_reported() {
        let tmp = TempDir::new().unwrap();
        let err = BackupStore::new(tmp.path())
            .load(&BackupId::from("nope"))
            .unwrap_err();
        assert!(matches!(err, SyncError::BackupNotFound(_)));
    }

    #[test]
    fn diff_reports_changed_fields_only() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path());
        let (tracker, epic) = seeded();
        let backup = store
            .create(&epic, &tracker.fetch_epic_children(&epic).unwrap(), "r")
            .unwrap();
        tracker
            .edit(&IssueKey::from("PROJ-1"), |i| {
                i.description = "new text".into();
                i.status = Status::Done;
            })
            .unwrap();

        let changes = store.diff(&backup.id, &tracker).unwrap();
        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["description", "status"]);
        assert!(changes[0].unified_diff().contains("-old text"));
        assert!(changes[0].unified_diff().contains("+new text"));
    }

    #[test]
    fn restore_plans_only_needed_commands() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path());
        let (tracker, epic) = seeded();
        let backup = store
            .create(&epic, &tracker.fetch_epic_children(&epic).unwrap(), "r")
            .unwrap();
        assert!(store.plan_restore(&backup.id, &tracker).unwrap().is_empty());

        tracker
            .edit(&IssueKey::from("PROJ-1"), |i| i.story_points = Some(8))
            .unwrap();
        let batch = store.plan_restore(&backup.id, &tracker).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.commands()[0].kind(), "update_story_points");

        let report = store
            .restore(&backup.id, &tracker, &BatchOptions::default())
            .unwrap();
        assert!(report.failed.is_empty());
        let now = tracker.fetch_issue(&IssueKey::from("PROJ-1")).unwrap();
        assert_eq!(now.story_points, Some(3));
    }

    #[test]
    fn restore_deletes_subtasks_and_comments_added_since() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path());
        let (tracker, epic) = seeded();
        let key = IssueKey::from("PROJ-1");
        let backup = store
            .create(&epic, &tracker.fetch_epic_children(&epic).unwrap(), "r")
            .unwrap();

        let comment = tracker.add_comment(&key, "ship it").unwrap();
        let sub = tracker
            .create_subtask(
                &key,
                &NewIssue {
                    summary: "Remember me".into(),
                    description: String::new(),
                    priority: None,
                    story_points: None,
                    idempotency_key: "US-1/ST-9".into(),
                },
            )
            .unwrap();

        let changes = store.diff(&backup.id, &tracker).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].issue, sub.key);
        assert_eq!(changes[0].backup, "<absent>");
        assert_eq!(changes[1].field, format!("comment {comment}"));
        assert_eq!(changes[1].current, "ship it");

        let batch = store.plan_restore(&backup.id, &tracker).unwrap();
        let kinds: Vec<&str> = batch.commands().iter().map(Command::kind).collect();
        assert_eq!(kinds, vec!["delete_subtask", "delete_comment"]);

        let report = store
            .restore(&backup.id, &tracker, &BatchOptions::default())
            .unwrap();
        assert!(report.failed.is_empty());
        let now = tracker.fetch_issue(&key).unwrap();
        assert!(now.subtasks.is_empty());
        assert!(now.comments.is_empty());
        assert!(store.diff(&backup.id, &tracker).unwrap().is_empty());
    }
}
