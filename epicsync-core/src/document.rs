//! Parser and Writeback ports, with YAML reference implementations.
//!
//! The engine never touches document files. A parser turns source text into
//! an [`Epic`]; after a successful run the engine hands identity (and, in
//! bidirectional mode, pulled remote fields) to a [`Writeback`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{FormatError, WritebackError};
use crate::issue::IssueFields;
use crate::types::{Description, Epic, IssueKey, StoryId};

// ---------------------------------------------------------------------------
// Parser port
// ---------------------------------------------------------------------------

pub trait DocumentParser {
    /// Short format name for messages, e.g. `yaml`.
    fn format(&self) -> &str;

    /// Parse a whole document. Must carry `external_key` / `external_url`
    /// through when the source records them.
    fn parse(&self, source: &str) -> Result<Epic, FormatError>;
}

/// YAML document parser: the document is the serde form of [`Epic`].
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlParser;

impl DocumentParser for YamlParser {
    fn format(&self) -> &str {
        "yaml"
    }

    fn parse(&self, source: &str) -> Result<Epic, FormatError> {
        let epic: Epic = serde_yaml::from_str(source)?;
        check_document(&epic)?;
        Ok(epic)
    }
}

/// Structural checks every parser result must pass.
pub fn check_document(epic: &Epic) -> Result<(), FormatError> {
    let mut seen = HashSet::new();
    for story in &epic.stories {
        if story.id.0.trim().is_empty() {
            return Err(FormatError::Invalid(format!(
                "story '{}' has an empty id",
                story.title
            )));
        }
        if story.title.trim().is_empty() {
            return Err(FormatError::Invalid(format!(
                "story {} has an empty title",
                story.id
            )));
        }
        if !seen.insert(story.id.clone()) {
            return Err(FormatError::Invalid(format!(
                "duplicate story id {}",
                story.id
            )));
        }
        let mut sub_seen = HashSet::new();
        for sub in &story.subtasks {
            if !sub_seen.insert(sub.id.clone()) {
                return Err(FormatError::Invalid(format!(
                    "duplicate subtask id {} in story {}",
                    sub.id, story.id
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Writeback port
// ---------------------------------------------------------------------------

pub trait Writeback {
    /// Persist a synced story's identity and new content hash.
    fn update_source(
        &mut self,
        story: &StoryId,
        external_key: &IssueKey,
        external_url: Option<&str>,
        new_hash: &str,
    ) -> Result<(), WritebackError>;

    fn update_subtask_source(
        &mut self,
        _story: &StoryId,
        _subtask: &StoryId,
        _external_key: &IssueKey,
    ) -> Result<(), WritebackError> {
        Ok(())
    }

    /// Bidirectional sync: remote values that should replace local ones.
    fn apply_remote(
        &mut self,
        _story: &StoryId,
        _fields: &IssueFields,
    ) -> Result<(), WritebackError> {
        Ok(())
    }

    /// Called once after all updates of a run.
    fn flush(&mut self) -> Result<(), WritebackError> {
        Ok(())
    }
}

/// Discards everything. Used by dry runs and callers without a source.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWriteback;

impl Writeback for NoopWriteback {
    fn update_source(
        &mut self,
        _story: &StoryId,
        _external_key: &IssueKey,
        _external_url: Option<&str>,
        _new_hash: &str,
    ) -> Result<(), WritebackError> {
        Ok(())
    }
}

/// One recorded [`Writeback::update_source`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUpdate {
    pub story: StoryId,
    pub external_key: IssueKey,
    pub external_url: Option<String>,
    pub new_hash: String,
}

/// Keeps every call in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingWriteback {
    pub updates: Vec<SourceUpdate>,
    pub subtasks: Vec<(StoryId, StoryId, IssueKey)>,
    pub pulled: Vec<(StoryId, IssueFields)>,
    pub flushed: usize,
}

impl Writeback for CollectingWriteback {
    fn update_source(
        &mut self,
        story: &StoryId,
        external_key: &IssueKey,
        external_url: Option<&str>,
        new_hash: &str,
    ) -> Result<(), WritebackError> {
        self.updates.push(SourceUpdate {
            story: story.clone(),
            external_key: external_key.clone(),
            external_url: external_url.map(str::to_string),
            new_hash: new_hash.to_string(),
        });
        Ok(())
    }

    fn update_subtask_source(
        &mut self,
        story: &StoryId,
        subtask: &StoryId,
        external_key: &IssueKey,
    ) -> Result<(), WritebackError> {
        self.subtasks
            .push((story.clone(), subtask.clone(), external_key.clone()));
        Ok(())
    }

    fn apply_remote(&mut self, story: &StoryId, fields: &IssueFields) -> Result<(), WritebackError> {
        self.pulled.push((story.clone(), fields.clone()));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WritebackError> {
        self.flushed += 1;
        Ok(())
    }
}

/// Rewrites a YAML document in place on [`Writeback::flush`].
///
/// Write flow: serialize → `.yaml.tmp` sibling → `rename`.
#[derive(Debug)]
pub struct YamlWriteback {
    path: PathBuf,
    epic: Epic,
    dirty: bool,
}

impl YamlWriteback {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WritebackError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|source| WritebackError::Io {
            path: path.clone(),
            source,
        })?;
        let epic: Epic = serde_yaml::from_str(&contents)?;
        Ok(Self {
            path,
            epic,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn epic(&self) -> &Epic {
        &self.epic
    }
}

impl Writeback for YamlWriteback {
    fn update_source(
        &mut self,
        story: &StoryId,
        external_key: &IssueKey,
        external_url: Option<&str>,
        new_hash: &str,
    ) -> Result<(), WritebackError> {
        let target = self
            .epic
            .story_mut(story)
            .ok_or_else(|| WritebackError::StoryNotFound(story.clone()))?;
        target.external_key = Some(external_key.clone());
        if let Some(url) = external_url {
            target.external_url = Some(url.to_string());
        }
        target.last_synced_hash = Some(new_hash.to_string());
        self.dirty = true;
        Ok(())
    }

    fn update_subtask_source(
        &mut self,
        story: &StoryId,
        subtask: &StoryId,
        external_key: &IssueKey,
    ) -> Result<(), WritebackError> {
        let target = self
            .epic
            .story_mut(story)
            .ok_or_else(|| WritebackError::StoryNotFound(story.clone()))?;
        if let Some(sub) = target.subtasks.iter_mut().find(|s| &s.id == subtask) {
            sub.external_key = Some(external_key.clone());
            self.dirty = true;
        }
        Ok(())
    }

    fn apply_remote(&mut self, story: &StoryId, fields: &IssueFields) -> Result<(), WritebackError> {
        let target = self
            .epic
            .story_mut(story)
            .ok_or_else(|| WritebackError::StoryNotFound(story.clone()))?;
        target.title = fields.summary.clone();
        if target.description.render() != fields.description {
            target.description = Description::Text(fields.description.clone());
        }
        target.status = fields.status;
        target.story_points = fields.story_points;
        if let Some(priority) = fields.priority {
            target.priority = priority;
        }
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WritebackError> {
        if !self.dirty {
            return Ok(());
        }
        let yaml = serde_yaml::to_string(&self.epic)?;
        let tmp = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).map_err(|source| WritebackError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| WritebackError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
