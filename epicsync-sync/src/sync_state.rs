//! Sync-state store: what each story looked like at its last successful sync.
//!
//! Persists a `SyncStateFile` JSON document at `<root>/state/<epic>.json`.
//! Writes use the same atomic `.tmp` + rename pattern as the tracker store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use epicsync_core::types::{IssueKey, StoryId};

use crate::error::{io_err, json_err, SyncError};

/// Per-story record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryState {
    pub issue_key: IssueKey,
    /// [`crate::hash::story_hash`] of the local content after the sync.
    pub local_hash: String,
    /// Tracker `updated` marker observed after the sync's own writes.
    #[serde(default)]
    pub remote_updated: String,
}

/// On-disk payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateFile {
    pub epic: IssueKey,
    pub synced_at: DateTime<Utc>,
    #[serde(default)]
    pub stories: BTreeMap<StoryId, StoryState>,
}

impl SyncStateFile {
    pub fn empty(epic: &IssueKey) -> Self {
        Self {
            epic: epic.clone(),
            synced_at: Utc::now(),
            stories: BTreeMap::new(),
        }
    }

    pub fn story(&self, id: &StoryId) -> Option<&StoryState> {
        self.stories.get(id)
    }
}

/// Filesystem-safe stem for an issue key.
pub(crate) fn file_stem(key: &IssueKey) -> String {
    key.as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `<root>/state/<epic>.json`: pure, no I/O.
pub fn state_path_at(root: &Path, epic: &IssueKey) -> PathBuf {
    root.join("state").join(format!("{}.json", file_stem(epic)))
}

/// Load the state for `epic`; an empty state if nothing was recorded yet.
pub fn load_at(root: &Path, epic: &IssueKey) -> Result<SyncStateFile, SyncError> {
    let path = state_path_at(root, epic);
    if !path.exists() {
        return Ok(SyncStateFile::empty(epic));
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&contents).map_err(|e| json_err(&path, e))
}

/// Save atomically: writes `<path>.tmp` then renames over `<path>`.
pub fn save_at(root: &Path, state: &SyncStateFile) -> Result<(), SyncError> {
    let path = state_path_at(root, &state.epic);
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid state path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(state).map_err(|e| json_err(&path, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}
