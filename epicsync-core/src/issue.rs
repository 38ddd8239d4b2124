//! Tracker-side model: what a Tracker Port returns and accepts.

use serde::{Deserialize, Serialize};

use crate::types::{IssueKey, Priority, Status, Story, Subtask};

/// A comment as stored by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerComment {
    pub id: String,
    pub body: String,
}

/// An issue as fetched from the tracker (story or subtask).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub key: IssueKey,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<u32>,
    #[serde(default)]
    pub subtasks: Vec<TrackerIssue>,
    #[serde(default)]
    pub comments: Vec<TrackerComment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Opaque last-modified marker. Only compared for equality.
    #[serde(default)]
    pub updated: String,
}

impl TrackerIssue {
    pub fn fields(&self) -> IssueFields {
        IssueFields {
            summary: self.summary.clone(),
            description: self.description.clone(),
            status: self.status,
            priority: self.priority,
            story_points: self.story_points,
        }
    }

    pub fn subtask(&self, key: &IssueKey) -> Option<&TrackerIssue> {
        self.subtasks.iter().find(|s| &s.key == key)
    }
}

/// The scalar fields the engine reads and writes on an issue.
///
/// Used for backups, conflict records and remote-to-local pulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueFields {
    pub summary: String,
    pub description: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<u32>,
}

impl IssueFields {
    pub fn from_story(story: &Story) -> Self {
        Self {
            summary: story.title.trim().to_string(),
            description: story.description.render(),
            status: story.status,
            priority: Some(story.priority),
            story_points: story.story_points,
        }
    }

    pub fn from_subtask(subtask: &Subtask) -> Self {
        Self {
            summary: subtask.title.trim().to_string(),
            description: subtask.description.trim().to_string(),
            status: subtask.status,
            priority: None,
            story_points: None,
        }
    }
}

/// Payload for `create_story` / `create_subtask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIssue {
    pub summary: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<u32>,
    /// Client-supplied hint; adapters must treat repeated creates carrying
    /// the same hint under the same parent as one create.
    pub idempotency_key: String,
}

impl NewIssue {
    pub fn from_story(story: &Story) -> Self {
        Self {
            summary: story.title.trim().to_string(),
            description: story.description.render(),
            priority: Some(story.priority),
            story_points: story.story_points,
            idempotency_key: story.id.0.clone(),
        }
    }

    pub fn from_subtask(parent: &Story, subtask: &Subtask) -> Self {
        Self {
            summary: subtask.title.trim().to_string(),
            description: subtask.description.trim().to_string(),
            priority: None,
            story_points: None,
            idempotency_key: format!("{}/{}", parent.id, subtask.id),
        }
    }
}

/// What a create call returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedIssue {
    pub key: IssueKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A partial update. `None` leaves a field untouched.
///
/// `story_points` is doubly optional so an update can clear the estimate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<Option<u32>>,
}

impl FieldUpdate {
    pub fn description(text: impl Into<String>) -> Self {
        Self {
            description: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn story_points(points: Option<u32>) -> Self {
        Self {
            story_points: Some(points),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.story_points.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Description;

    #[test]
    fn story_fields_use_rendered_description() {
        let mut story = Story::new("US-1", "  Login ");
        story.description = Description::Structured {
            role: "user".into(),
            want: "to log in".into(),
            benefit: "access".into(),
        };
        let fields = IssueFields::from_story(&story);
        assert_eq!(fields.summary, "Login");
        assert!(fields.description.starts_with("As a user"));
    }

    #[test]
    fn subtask_idempotency_key_is_scoped_to_parent() {
        let parent = Story::new("US-1", "Login");
        let sub = Subtask {
            id: "ST-1".into(),
            title: "Form".into(),
            description: String::new(),
            status: Status::Open,
            external_key: None,
        };
        assert_eq!(NewIssue::from_subtask(&parent, &sub).idempotency_key, "US-1/ST-1");
    }

    #[test]
    fn empty_field_update() {
        assert!(FieldUpdate::default().is_empty());
        assert!(!FieldUpdate::story_points(None).is_empty());
    }
}
