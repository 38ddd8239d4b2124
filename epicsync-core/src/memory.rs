//! In-process tracker adapter.
//!
//! Backs the `memory` registry entry and, through [`TrackerStore`], the
//! JSON-file adapter. Also offers fault injection so callers can exercise
//! retry and partial-failure paths without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::TrackerError;
use crate::issue::{CreatedIssue, FieldUpdate, NewIssue, TrackerComment, TrackerIssue};
use crate::tracker::{Capabilities, Tracker};
use crate::types::{IssueKey, Status};

/// One issue row. Subtasks are linked through `parent`, never nested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIssue {
    pub issue: TrackerIssue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic: Option<IssueKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<IssueKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Serializable state shared by the memory and file adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStore {
    pub project: String,
    #[serde(default)]
    pub next_issue: u64,
    #[serde(default)]
    pub next_comment: u64,
    #[serde(default)]
    pub revision: u64,
    /// Insertion-ordered keys; `issues` is keyed for lookup.
    #[serde(default)]
    pub order: Vec<IssueKey>,
    #[serde(default)]
    pub issues: BTreeMap<IssueKey, StoredIssue>,
}

impl TrackerStore {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            next_issue: 1,
            ..Self::default()
        }
    }

    fn bump(&mut self) -> String {
        self.revision += 1;
        format!("rev-{}", self.revision)
    }

    fn allocate_key(&mut self) -> IssueKey {
        loop {
            let key = IssueKey(format!("{}-{}", self.project, self.next_issue));
            self.next_issue += 1;
            if !self.issues.contains_key(&key) {
                return key;
            }
        }
    }

    fn assemble(&self, key: &IssueKey) -> Option<TrackerIssue> {
        let stored = self.issues.get(key)?;
        let mut issue = stored.issue.clone();
        issue.subtasks = self
            .order
            .iter()
            .filter_map(|k| self.issues.get(k))
            .filter(|row| row.parent.as_ref() == Some(key))
            .map(|row| row.issue.clone())
            .collect();
        Some(issue)
    }

    fn find_by_hint(&self, scope: &IssueKey, hint: &str, as_subtask: bool) -> Option<IssueKey> {
        self.issues.values().find_map(|row| {
            let owner = if as_subtask { &row.parent } else { &row.epic };
            (owner.as_ref() == Some(scope) && row.idempotency_key.as_deref() == Some(hint))
                .then(|| row.issue.key.clone())
        })
    }

    fn create(
        &mut self,
        scope: &IssueKey,
        data: &NewIssue,
        as_subtask: bool,
    ) -> Result<CreatedIssue, TrackerError> {
        if as_subtask && !self.issues.contains_key(scope) {
            return Err(TrackerError::not_found(scope));
        }
        if let Some(existing) = self.find_by_hint(scope, &data.idempotency_key, as_subtask) {
            let url = self.issues.get(&existing).and_then(|r| r.issue.url.clone());
            return Ok(CreatedIssue { key: existing, url });
        }
        let key = self.allocate_key();
        let updated = self.bump();
        let url = Some(format!("memory://{}/{}", self.project, key));
        let issue = TrackerIssue {
            key: key.clone(),
            summary: data.summary.clone(),
            description: data.description.clone(),
            status: Status::Open,
            priority: data.priority,
            story_points: data.story_points,
            subtasks: vec![],
            comments: vec![],
            url: url.clone(),
            updated,
        };
        let row = StoredIssue {
            issue,
            epic: (!as_subtask).then(|| scope.clone()),
            parent: as_subtask.then(|| scope.clone()),
            idempotency_key: Some(data.idempotency_key.clone()),
        };
        self.order.push(key.clone());
        self.issues.insert(key.clone(), row);
        Ok(CreatedIssue { key, url })
    }

    fn with_issue<T>(
        &mut self,
        key: &IssueKey,
        f: impl FnOnce(&mut TrackerIssue) -> T,
    ) -> Result<T, TrackerError> {
        let updated = self.bump();
        let row = self
            .issues
            .get_mut(key)
            .ok_or_else(|| TrackerError::not_found(key))?;
        let out = f(&mut row.issue);
        row.issue.updated = updated;
        Ok(out)
    }

    fn apply_update(&mut self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        self.with_issue(key, |issue| {
            if let Some(summary) = &fields.summary {
                issue.summary = summary.clone();
            }
            if let Some(description) = &fields.description {
                issue.description = description.clone();
            }
            if let Some(priority) = fields.priority {
                issue.priority = Some(priority);
            }
            if let Some(points) = fields.story_points {
                issue.story_points = points;
            }
        })
    }

    fn epic_children(&self, epic: &IssueKey) -> Vec<TrackerIssue> {
        self.order
            .iter()
            .filter(|k| {
                self.issues
                    .get(*k)
                    .map(|row| row.epic.as_ref() == Some(epic))
                    .unwrap_or(false)
            })
            .filter_map(|k| self.assemble(k))
            .collect()
    }

    fn add_comment(&mut self, key: &IssueKey, body: &str) -> Result<String, TrackerError> {
        self.next_comment += 1;
        let id = format!("c-{}", self.next_comment);
        let comment = TrackerComment {
            id: id.clone(),
            body: body.to_string(),
        };
        self.with_issue(key, |issue| issue.comments.push(comment))?;
        Ok(id)
    }

    fn delete_comment(&mut self, key: &IssueKey, comment_id: &str) -> Result<(), TrackerError> {
        let found = self.with_issue(key, |issue| {
            let before = issue.comments.len();
            issue.comments.retain(|c| c.id != comment_id);
            before != issue.comments.len()
        })?;
        if found {
            Ok(())
        } else {
            Err(TrackerError::api(
                404,
                format!("comment {comment_id} not found on {key}"),
            ))
        }
    }

    fn delete_issue(&mut self, key: &IssueKey) -> Result<(), TrackerError> {
        if self.issues.remove(key).is_none() {
            return Err(TrackerError::not_found(key));
        }
        let orphans: Vec<IssueKey> = self
            .issues
            .values()
            .filter(|row| row.parent.as_ref() == Some(key))
            .map(|row| row.issue.key.clone())
            .collect();
        for child in &orphans {
            self.issues.remove(child);
        }
        self.order
            .retain(|k| k != key && !orphans.iter().any(|o| o == k));
        Ok(())
    }

    /// Insert a story (and its nested subtasks) under `epic`, as if it had
    /// been created remotely by someone else.
    pub fn seed(&mut self, epic: &IssueKey, mut issue: TrackerIssue) {
        let subtasks = std::mem::take(&mut issue.subtasks);
        if issue.updated.is_empty() {
            issue.updated = self.bump();
        }
        let parent = issue.key.clone();
        self.order.push(parent.clone());
        self.issues.insert(
            parent.clone(),
            StoredIssue {
                issue,
                epic: Some(epic.clone()),
                parent: None,
                idempotency_key: None,
            },
        );
        for mut sub in subtasks {
            sub.subtasks.clear();
            if sub.updated.is_empty() {
                sub.updated = self.bump();
            }
            self.order.push(sub.key.clone());
            self.issues.insert(
                sub.key.clone(),
                StoredIssue {
                    issue: sub,
                    epic: None,
                    parent: Some(parent.clone()),
                    idempotency_key: None,
                },
            );
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Per-operation queue of errors returned before the call reaches the store.
    pending: HashMap<String, VecDeque<TrackerError>>,
    calls: HashMap<String, usize>,
}

/// Thread-safe in-memory tracker.
#[derive(Debug)]
pub struct MemoryTracker {
    name: String,
    capabilities: Capabilities,
    store: RwLock<TrackerStore>,
    faults: RwLock<Faults>,
}

impl MemoryTracker {
    pub fn new(project: impl Into<String>) -> Self {
        Self::from_store(TrackerStore::new(project))
    }

    pub fn from_store(store: TrackerStore) -> Self {
        Self {
            name: "memory".to_string(),
            capabilities: Capabilities::full(),
            store: RwLock::new(store),
            faults: RwLock::new(Faults::default()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Copy of the whole backing store.
    pub fn store(&self) -> TrackerStore {
        self.store.read().clone()
    }

    pub fn seed(&self, epic: &IssueKey, issue: TrackerIssue) {
        self.store.write().seed(epic, issue);
    }

    /// Apply a remote-side edit, bumping the issue's `updated` marker.
    pub fn edit(
        &self,
        key: &IssueKey,
        f: impl FnOnce(&mut TrackerIssue),
    ) -> Result<(), TrackerError> {
        self.store.write().with_issue(key, f)
    }

    /// Make the next call to `operation` fail with `error`. Queued errors are
    /// consumed in order; `"*"` matches any operation.
    pub fn fail_next(&self, operation: &str, error: TrackerError) {
        self.faults
            .write()
            .pending
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Number of times `operation` was invoked, failed attempts included.
    pub fn calls(&self, operation: &str) -> usize {
        self.faults.read().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.faults.read().calls.values().sum()
    }

    fn enter(&self, operation: &str) -> Result<(), TrackerError> {
        let mut faults = self.faults.write();
        *faults.calls.entry(operation.to_string()).or_default() += 1;
        for slot in [operation, "*"] {
            if let Some(queue) = faults.pending.get_mut(slot) {
                if let Some(err) = queue.pop_front() {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

impl Tracker for MemoryTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn fetch_epic_children(&self, epic: &IssueKey) -> Result<Vec<TrackerIssue>, TrackerError> {
        self.enter("fetch_epic_children")?;
        Ok(self.store.read().epic_children(epic))
    }

    fn fetch_issue(&self, key: &IssueKey) -> Result<TrackerIssue, TrackerError> {
        self.enter("fetch_issue")?;
        self.store
            .read()
            .assemble(key)
            .ok_or_else(|| TrackerError::not_found(key))
    }

    fn create_story(
        &self,
        epic: &IssueKey,
        data: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError> {
        self.enter("create_story")?;
        self.store.write().create(epic, data, false)
    }

    fn update_story(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        self.enter("update_story")?;
        self.store.write().apply_update(key, fields)
    }

    fn create_subtask(
        &self,
        parent: &IssueKey,
        data: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError> {
        self.enter("create_subtask")?;
        self.store.write().create(parent, data, true)
    }

    fn update_subtask(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        self.enter("update_subtask")?;
        self.store.write().apply_update(key, fields)
    }

    fn transition_status(&self, key: &IssueKey, status: Status) -> Result<(), TrackerError> {
        self.enter("transition_status")?;
        self.store
            .write()
            .with_issue(key, |issue| issue.status = status)
    }

    fn add_comment(&self, key: &IssueKey, body: &str) -> Result<String, TrackerError> {
        self.enter("add_comment")?;
        self.store.write().add_comment(key, body)
    }

    fn delete_issue(&self, key: &IssueKey) -> Result<(), TrackerError> {
        self.enter("delete_issue")?;
        self.store.write().delete_issue(key)
    }

    fn delete_comment(&self, key: &IssueKey, comment_id: &str) -> Result<(), TrackerError> {
        self.enter("delete_comment")?;
        self.store.write().delete_comment(key, comment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epic() -> IssueKey {
        IssueKey::from("PROJ-100")
    }

    fn new_issue(summary: &str, hint: &str) -> NewIssue {
        NewIssue {
            summary: summary.into(),
            description: String::new(),
            priority: None,
            story_points: None,
            idempotency_key: hint.into(),
        }
    }

    #[test]
    fn create_then_fetch_children() {
        let tracker = MemoryTracker::new("PROJ");
        let created = tracker
            .create_story(&epic(), &new_issue("Login", "US-1"))
            .expect("create");
        tracker
            .create_subtask(&created.key, &new_issue("Form", "US-1/ST-1"))
            .expect("subtask");

        let children = tracker.fetch_epic_children(&epic()).expect("fetch");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].summary, "Login");
        assert_eq!(children[0].subtasks.len(), 1);
    }

    #[test]
    fn repeated_create_with_same_hint_is_idempotent() {
        let tracker = MemoryTracker::new("PROJ");
        let a = tracker.create_story(&epic(), &new_issue("Login", "US-1")).unwrap();
        let b = tracker.create_story(&epic(), &new_issue("Login", "US-1")).unwrap();
        assert_eq!(a.key, b.key);
        assert_eq!(tracker.fetch_epic_children(&epic()).unwrap().len(), 1);
    }

    #[test]
    fn every_write_bumps_updated_marker() {
        let tracker = MemoryTracker::new("PROJ");
        let created = tracker.create_story(&epic(), &new_issue("Login", "US-1")).unwrap();
        let before = tracker.fetch_issue(&created.key).unwrap().updated;
        tracker
            .transition_status(&created.key, Status::Done)
            .unwrap();
        let after = tracker.fetch_issue(&created.key).unwrap().updated;
        assert_ne!(before, after);
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let tracker = MemoryTracker::new("PROJ");
        tracker.fail_next("fetch_epic_children", TrackerError::rate_limited());
        assert!(tracker.fetch_epic_children(&epic()).is_err());
        assert!(tracker.fetch_epic_children(&epic()).is_ok());
        assert_eq!(tracker.calls("fetch_epic_children"), 2);
    }

    #[test]
    fn delete_issue_removes_subtasks() {
        let tracker = MemoryTracker::new("PROJ");
        let story = tracker.create_story(&epic(), &new_issue("Login", "US-1")).unwrap();
        let sub = tracker
            .create_subtask(&story.key, &new_issue("Form", "US-1/ST-1"))
            .unwrap();
        tracker.delete_issue(&story.key).unwrap();
        assert!(tracker.fetch_issue(&sub.key).is_err());
        assert!(tracker.fetch_epic_children(&epic()).unwrap().is_empty());
    }

    #[test]
    fn comment_roundtrip() {
        let tracker = MemoryTracker::new("PROJ");
        let story = tracker.create_story(&epic(), &new_issue("Login", "US-1")).unwrap();
        let id = tracker.add_comment(&story.key, "hello").unwrap();
        assert_eq!(tracker.fetch_issue(&story.key).unwrap().comments.len(), 1);
        tracker.delete_comment(&story.key, &id).unwrap();
        assert!(tracker.fetch_issue(&story.key).unwrap().comments.is_empty());
        assert!(tracker.delete_comment(&story.key, &id).is_err());
    }

    #[test]
    fn seeded_subtasks_are_linked_to_parent() {
        let tracker = MemoryTracker::new("PROJ");
        let sub = TrackerIssue {
            key: IssueKey::from("PROJ-2"),
            summary: "Form".into(),
            description: String::new(),
            status: Status::Open,
            priority: None,
            story_points: None,
            subtasks: vec![],
            comments: vec![],
            url: None,
            updated: String::new(),
        };
        let story = TrackerIssue {
            key: IssueKey::from("PROJ-1"),
            summary: "Login".into(),
            subtasks: vec![sub],
            ..sub_template()
        };
        tracker.seed(&epic(), story);
        let fetched = tracker.fetch_issue(&IssueKey::from("PROJ-1")).unwrap();
        assert_eq!(fetched.subtasks.len(), 1);
        assert!(!fetched.updated.is_empty());
    }

    fn sub_template() -> TrackerIssue {
        TrackerIssue {
            key: IssueKey::from("X-0"),
            summary: String::new(),
            description: String::new(),
            status: Status::Open,
            priority: None,
            story_points: None,
            subtasks: vec![],
            comments: vec![],
            url: None,
            updated: String::new(),
        }
    }
}
