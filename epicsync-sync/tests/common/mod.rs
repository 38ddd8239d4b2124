#![allow(dead_code)]

use std::sync::Arc;

use epicsync_core::error::TrackerError;
use epicsync_core::issue::{CreatedIssue, FieldUpdate, NewIssue, TrackerIssue};
use epicsync_core::tracker::{Capabilities, Tracker};
use epicsync_core::types::{Description, Epic, IssueKey, Status, Story, Subtask};
use epicsync_core::{MemoryTracker, SyncConfig};
use epicsync_sync::{CancelToken, Governor, ManualClock, SyncOptions, SyncOrchestrator};

pub const EPIC: &str = "PROJ-100";

pub fn epic(stories: Vec<Story>) -> Epic {
    Epic {
        key: IssueKey::from(EPIC),
        title: "Authentication".into(),
        stories,
    }
}

pub fn story(id: &str, title: &str, description: &str) -> Story {
    let mut story = Story::new(id, title);
    story.description = Description::Text(description.into());
    story
}

pub fn subtask(id: &str, title: &str, description: &str, status: Status) -> Subtask {
    Subtask {
        id: id.into(),
        title: title.into(),
        description: description.into(),
        status,
        external_key: None,
    }
}

pub fn remote(key: &str, summary: &str, description: &str) -> TrackerIssue {
    TrackerIssue {
        key: IssueKey::from(key),
        summary: summary.into(),
        description: description.into(),
        status: Status::Open,
        priority: None,
        story_points: None,
        subtasks: vec![],
        comments: vec![],
        url: None,
        updated: String::new(),
    }
}

/// Governor on a manual clock: retries and throttling never sleep.
pub fn manual_governor() -> (Governor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let mut config = SyncConfig::default();
    config.tracker.kind = "memory".into();
    (Governor::from_config(&config, clock.clone()), clock)
}

pub fn orchestrator(tracker: &dyn Tracker, options: SyncOptions) -> SyncOrchestrator<'_> {
    let (governor, _) = manual_governor();
    SyncOrchestrator::new(tracker, options).with_governor(governor)
}

/// Options with backups off; tests turn on what they exercise.
pub fn options() -> SyncOptions {
    SyncOptions {
        backup: false,
        ..SyncOptions::default()
    }
}

/// Memory tracker that raises a cancel token once `operation` has been
/// called `after` times.
pub struct CancellingTracker {
    pub inner: MemoryTracker,
    pub operation: &'static str,
    pub after: usize,
    pub token: CancelToken,
}

impl CancellingTracker {
    fn tick(&self, operation: &str) {
        if operation == self.operation && self.inner.calls(operation) >= self.after {
            self.token.cancel();
        }
    }
}

impl Tracker for CancellingTracker {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn fetch_epic_children(&self, epic: &IssueKey) -> Result<Vec<TrackerIssue>, TrackerError> {
        self.inner.fetch_epic_children(epic)
    }

    fn fetch_issue(&self, key: &IssueKey) -> Result<TrackerIssue, TrackerError> {
        self.inner.fetch_issue(key)
    }

    fn create_story(&self, epic: &IssueKey, data: &NewIssue) -> Result<CreatedIssue, TrackerError> {
        let out = self.inner.create_story(epic, data);
        self.tick("create_story");
        out
    }

    fn update_story(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        let out = self.inner.update_story(key, fields);
        self.tick("update_story");
        out
    }

    fn create_subtask(&self, parent: &IssueKey, data: &NewIssue) -> Result<CreatedIssue, TrackerError> {
        let out = self.inner.create_subtask(parent, data);
        self.tick("create_subtask");
        out
    }

    fn update_subtask(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        self.inner.update_subtask(key, fields)
    }

    fn transition_status(&self, key: &IssueKey, status: Status) -> Result<(), TrackerError> {
        self.inner.transition_status(key, status)
    }

    fn add_comment(&self, key: &IssueKey, body: &str) -> Result<String, TrackerError> {
        self.inner.add_comment(key, body)
    }

    fn delete_issue(&self, key: &IssueKey) -> Result<(), TrackerError> {
        self.inner.delete_issue(key)
    }

    fn delete_comment(&self, key: &IssueKey, comment_id: &str) -> Result<(), TrackerError> {
        self.inner.delete_comment(key, comment_id)
    }
}
