//! Document model: the parsed epic / story / subtask / comment tree.
//!
//! Every type round-trips through serde so that the reference YAML parser and
//! writeback can load and persist documents without a hand-written grammar.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A tracker-assigned issue key, e.g. `PROJ-123`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueKey(pub String);

impl IssueKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for IssueKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IssueKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A document-local story or subtask identifier, e.g. `US-7`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(pub String);

impl StoryId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for StoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StoryId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Priority of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Highest,
    High,
    #[default]
    Medium,
    Low,
    Lowest,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Highest => write!(f, "highest"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
            Priority::Lowest => write!(f, "lowest"),
        }
    }
}

/// Workflow status shared by stories and subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    #[serde(alias = "todo", alias = "to_do", alias = "planned", alias = "backlog")]
    Open,
    #[serde(alias = "in-progress", alias = "doing")]
    InProgress,
    #[serde(alias = "in-review", alias = "review")]
    InReview,
    #[serde(alias = "closed", alias = "resolved", alias = "complete")]
    Done,
    #[serde(alias = "canceled", alias = "wontfix")]
    Cancelled,
}

impl Status {
    pub fn all() -> &'static [Status] {
        &[
            Status::Open,
            Status::InProgress,
            Status::InReview,
            Status::Done,
            Status::Cancelled,
        ]
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Open => write!(f, "Open"),
            Status::InProgress => write!(f, "In Progress"),
            Status::InReview => write!(f, "In Review"),
            Status::Done => write!(f, "Done"),
            Status::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl FromStr for Status {
    type Err = String;

    /// Accepts the display form as well as the common tracker spellings
    /// (`to do`, `in-progress`, `closed`, ...), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();
        match folded.as_str() {
            "open" | "todo" | "to_do" | "planned" | "backlog" => Ok(Status::Open),
            "in_progress" | "doing" => Ok(Status::InProgress),
            "in_review" | "review" => Ok(Status::InReview),
            "done" | "closed" | "resolved" | "complete" => Ok(Status::Done),
            "cancelled" | "canceled" | "wontfix" => Ok(Status::Cancelled),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Description
// ---------------------------------------------------------------------------

/// A story description: either the classic user-story triple or free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Structured {
        role: String,
        want: String,
        benefit: String,
    },
    Text(String),
}

impl Default for Description {
    fn default() -> Self {
        Description::Text(String::new())
    }
}

impl Description {
    /// The tracker-facing text form. Trackers store descriptions as plain
    /// text, so field comparison always happens on this rendering.
    pub fn render(&self) -> String {
        match self {
            Description::Structured {
                role,
                want,
                benefit,
            } => format!(
                "As a {}, I want {}, so that {}",
                role.trim(),
                want.trim(),
                benefit.trim()
            ),
            Description::Text(text) => text.trim().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Description::Structured {
                role,
                want,
                benefit,
            } => role.trim().is_empty() && want.trim().is_empty() && benefit.trim().is_empty(),
            Description::Text(text) => text.trim().is_empty(),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A comment attached to a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// A child work item of a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: StoryId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_key: Option<IssueKey>,
}

/// A unit of work inside an epic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub title: String,
    #[serde(default)]
    pub description: Description,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<u32>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_key: Option<IssueKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    /// Content fingerprint recorded at the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_hash: Option<String>,
}

impl Story {
    /// Minimal constructor; everything else takes its default.
    pub fn new(id: impl Into<StoryId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: Description::default(),
            priority: Priority::default(),
            status: Status::default(),
            story_points: None,
            subtasks: vec![],
            comments: vec![],
            external_key: None,
            external_url: None,
            last_synced_hash: None,
        }
    }
}

/// Top-level grouping of stories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    /// Tracker key of the epic issue. Stories are fetched as its children.
    pub key: IssueKey,
    pub title: String,
    #[serde(default)]
    pub stories: Vec<Story>,
}

impl Epic {
    pub fn story(&self, id: &StoryId) -> Option<&Story> {
        self.stories.iter().find(|s| &s.id == id)
    }

    pub fn story_mut(&mut self, id: &StoryId) -> Option<&mut Story> {
        self.stories.iter_mut().find(|s| &s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
