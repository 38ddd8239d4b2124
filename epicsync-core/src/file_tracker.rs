//! JSON-file-backed tracker adapter.
//!
//! A durable local stand-in for a remote tracker: the whole store lives in one
//! JSON document, rewritten with `.tmp` + rename after every successful write.

use std::path::{Path, PathBuf};

use crate::error::{RegistryError, TrackerError};
use crate::issue::{CreatedIssue, FieldUpdate, NewIssue, TrackerIssue};
use crate::memory::{MemoryTracker, TrackerStore};
use crate::tracker::{Capabilities, Tracker};
use crate::types::{IssueKey, Status};

#[derive(Debug)]
pub struct FileTracker {
    path: PathBuf,
    inner: MemoryTracker,
}

impl FileTracker {
    /// Open the store at `path`, creating an empty one for `project` if the
    /// file does not exist yet.
    pub fn open(path: impl Into<PathBuf>, project: &str) -> Result<Self, RegistryError> {
        let path = path.into();
        let store = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str::<TrackerStore>(&contents).map_err(|source| {
                RegistryError::Json {
                    path: path.clone(),
                    source,
                }
            })?
        } else {
            TrackerStore::new(project)
        };
        Ok(Self {
            path,
            inner: MemoryTracker::from_store(store).with_name("file"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seed(&self, epic: &IssueKey, issue: TrackerIssue) -> Result<(), TrackerError> {
        self.inner.seed(epic, issue);
        self.persist()
    }

    fn persist(&self) -> Result<(), TrackerError> {
        save_store(&self.path, &self.inner.store())
            .map_err(|e| TrackerError::api(500, format!("failed to persist tracker store: {e}")))
    }

    fn write<T>(&self, result: Result<T, TrackerError>) -> Result<T, TrackerError> {
        let value = result?;
        self.persist()?;
        Ok(value)
    }
}

/// Atomically write `store` to `path` (`.json.tmp` sibling, then rename).
pub fn save_store(path: &Path, store: &TrackerStore) -> Result<(), RegistryError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|source| RegistryError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
    }
    let json = serde_json::to_string_pretty(store).map_err(|source| RegistryError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|source| RegistryError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl Tracker for FileTracker {
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

    fn create_story(
        &self,
        epic: &IssueKey,
        data: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError> {
        self.write(self.inner.create_story(epic, data))
    }

    fn update_story(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        self.write(self.inner.update_story(key, fields))
    }

    fn create_subtask(
        &self,
        parent: &IssueKey,
        data: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError> {
        self.write(self.inner.create_subtask(parent, data))
    }

    fn update_subtask(&self, key: &IssueKey, fields: &FieldUpdate) -> Result<(), TrackerError> {
        self.write(self.inner.update_subtask(key, fields))
    }

    fn transition_status(&self, key: &IssueKey, status: Status) -> Result<(), TrackerError> {
        self.write(self.inner.transition_status(key, status))
    }

    fn add_comment(&self, key: &IssueKey, body: &str) -> Result<String, TrackerError> {
        self.write(self.inner.add_comment(key, body))
    }

    fn delete_issue(&self, key: &IssueKey) -> Result<(), TrackerError> {
        self.write(self.inner.delete_issue(key))
    }

    fn delete_comment(&self, key: &IssueKey, comment_id: &str) -> Result<(), TrackerError> {
        self.write(self.inner.delete_comment(key, comment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tracker.json");
        let epic = IssueKey::from("PROJ-1");

        let tracker = FileTracker::open(&path, "PROJ").expect("open");
        let created = tracker
            .create_story(
                &epic,
                &NewIssue {
                    summary: "Login".into(),
                    description: "desc".into(),
                    priority: None,
                    story_points: Some(3),
                    idempotency_key: "US-1".into(),
                },
            )
            .expect("create");
        drop(tracker);

        let reopened = FileTracker::open(&path, "PROJ").expect("reopen");
        let issue = reopened.fetch_issue(&created.key).expect("fetch");
        assert_eq!(issue.summary, "Login");
        assert_eq!(issue.story_points, Some(3));
    }

    #[test]
    fn tmp_file_cleaned_up_after_save() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("tracker.json");
        save_store(&path, &TrackerStore::new("PROJ")).expect("save");
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_store_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tracker.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FileTracker::open(&path, "PROJ").unwrap_err();
        assert!(matches!(err, RegistryError::Json { .. }));
        assert!(err.to_string().contains("tracker.json"));
    }
}
