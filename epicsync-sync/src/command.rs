//! Reversible tracker writes.
//!
//! Every variant carries the state it moves from and to, so `undo` is the
//! data-driven inverse of `execute`. Targets created earlier in the same
//! lane are referenced by their idempotency hint ([`IssueRef::Pending`]) and
//! resolved through [`LaneKeys`] at execution time.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use epicsync_core::error::TrackerError;
use epicsync_core::issue::{FieldUpdate, NewIssue};
use epicsync_core::tracker::Tracker;
use epicsync_core::types::{IssueKey, Status, StoryId};

/// Where a command writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueRef {
    Key(IssueKey),
    /// Created by an earlier command of the same lane; holds that command's
    /// idempotency hint (`US-1` or `US-1/ST-2`).
    Pending(String),
}

impl IssueRef {
    pub fn pending_story(story: &StoryId) -> Self {
        IssueRef::Pending(story.0.clone())
    }

    pub fn pending_subtask(story: &StoryId, subtask: &StoryId) -> Self {
        IssueRef::Pending(format!("{story}/{subtask}"))
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueRef::Key(key) => write!(f, "{key}"),
            IssueRef::Pending(hint) => write!(f, "<new {hint}>"),
        }
    }
}

impl From<IssueKey> for IssueRef {
    fn from(key: IssueKey) -> Self {
        IssueRef::Key(key)
    }
}

/// Keys of issues created so far in one lane, by idempotency hint.
#[derive(Debug, Default, Clone)]
pub struct LaneKeys(HashMap<String, IssueKey>);

impl LaneKeys {
    pub fn insert(&mut self, hint: impl Into<String>, key: IssueKey) {
        self.0.insert(hint.into(), key);
    }

    pub fn resolve(&self, target: &IssueRef) -> Option<IssueKey> {
        match target {
            IssueRef::Key(key) => Some(key.clone()),
            IssueRef::Pending(hint) => self.0.get(hint).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    CreateStory {
        story: StoryId,
        epic: IssueKey,
        data: NewIssue,
    },
    CreateSubtask {
        story: StoryId,
        subtask: StoryId,
        parent: IssueRef,
        data: NewIssue,
    },
    UpdateDescription {
        story: StoryId,
        target: IssueRef,
        before: String,
        after: String,
    },
    UpdateStoryPoints {
        story: StoryId,
        target: IssueRef,
        before: Option<u32>,
        after: Option<u32>,
    },
    /// Subtask description change.
    UpdateSubtask {
        story: StoryId,
        subtask: StoryId,
        target: IssueRef,
        before: String,
        after: String,
    },
    TransitionStatus {
        story: StoryId,
        /// Set when the transition targets a subtask.
        #[serde(skip_serializing_if = "Option::is_none")]
        subtask: Option<StoryId>,
        target: IssueRef,
        before: Status,
        after: Status,
    },
    AddComment {
        story: StoryId,
        target: IssueRef,
        body: String,
    },
    /// Remove a subtask; `data` is what `undo` recreates it from.
    DeleteSubtask {
        story: StoryId,
        subtask: StoryId,
        parent: IssueKey,
        target: IssueRef,
        data: NewIssue,
    },
    DeleteComment {
        story: StoryId,
        target: IssueRef,
        comment_id: String,
        body: String,
    },
}

/// What `execute` did; the input `undo` needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    /// Resolved target, or the new issue for creates.
    pub key: IssueKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
}

impl CommandOutcome {
    fn at(key: IssueKey) -> Self {
        Self {
            key,
            url: None,
            comment_id: None,
        }
    }
}

/// A command could not run because its pending target was never created.
fn unresolved(target: &IssueRef) -> TrackerError {
    TrackerError::api(424, format!("target {target} was not created"))
}

impl Command {
    /// Story (lane) this command belongs to.
    pub fn story(&self) -> &StoryId {
        match self {
            Command::CreateStory { story, .. }
            | Command::CreateSubtask { story, .. }
            | Command::UpdateDescription { story, .. }
            | Command::UpdateStoryPoints { story, .. }
            | Command::UpdateSubtask { story, .. }
            | Command::TransitionStatus { story, .. }
            | Command::AddComment { story, .. }
            | Command::DeleteSubtask { story, .. }
            | Command::DeleteComment { story, .. } => story,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateStory { .. } => "create_story",
            Command::CreateSubtask { .. } => "create_subtask",
            Command::UpdateDescription { .. } => "update_description",
            Command::UpdateStoryPoints { .. } => "update_story_points",
            Command::UpdateSubtask { .. } => "update_subtask",
            Command::TransitionStatus { .. } => "transition_status",
            Command::AddComment { .. } => "add_comment",
            Command::DeleteSubtask { .. } => "delete_subtask",
            Command::DeleteComment { .. } => "delete_comment",
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Command::CreateStory { .. } | Command::CreateSubtask { .. }
        )
    }

    /// The issue written to (the parent, for subtask creation).
    pub fn target(&self) -> IssueRef {
        match self {
            Command::CreateStory { story, .. } => IssueRef::pending_story(story),
            Command::CreateSubtask { parent, .. } => parent.clone(),
            Command::UpdateDescription { target, .. }
            | Command::UpdateStoryPoints { target, .. }
            | Command::UpdateSubtask { target, .. }
            | Command::TransitionStatus { target, .. }
            | Command::AddComment { target, .. }
            | Command::DeleteSubtask { target, .. }
            | Command::DeleteComment { target, .. } => target.clone(),
        }
    }

    /// Idempotency hint under which a create registers its new key.
    pub fn creates(&self) -> Option<&str> {
        match self {
            Command::CreateStory { data, .. } | Command::CreateSubtask { data, .. } => {
                Some(&data.idempotency_key)
            }
            _ => None,
        }
    }

    /// One-line human description; the only thing a dry run produces.
    pub fn preview(&self) -> String {
        match self {
            Command::CreateStory { story, epic, data } => {
                format!("create story {story} \"{}\" under {epic}", data.summary)
            }
            Command::CreateSubtask {
                subtask,
                parent,
                data,
                ..
            } => format!("create subtask {subtask} \"{}\" under {parent}", data.summary),
            Command::UpdateDescription { target, story, .. } => {
                format!("update description of {target} ({story})")
            }
            Command::UpdateStoryPoints {
                target,
                before,
                after,
                ..
            } => format!(
                "set story points of {target}: {} -> {}",
                points(*before),
                points(*after)
            ),
            Command::UpdateSubtask {
                target, subtask, ..
            } => format!("update subtask {target} ({subtask}) description"),
            Command::TransitionStatus {
                target,
                before,
                after,
                ..
            } => format!("transition {target}: {before} -> {after}"),
            Command::AddComment { target, body, .. } => {
                format!("add comment to {target}: \"{}\"", excerpt(body))
            }
            Command::DeleteSubtask {
                target, parent, data, ..
            } => format!("delete subtask {target} \"{}\" of {parent}", data.summary),
            Command::DeleteComment {
                target,
                comment_id,
                body,
                ..
            } => format!("delete comment {comment_id} on {target}: \"{}\"", excerpt(body)),
        }
    }

    /// Perform the write. Creates register their key in `keys`.
    pub fn execute(
        &self,
        tracker: &dyn Tracker,
        keys: &mut LaneKeys,
    ) -> Result<CommandOutcome, TrackerError> {
        match self {
            Command::CreateStory { epic, data, .. } => {
                let created = tracker.create_story(epic, data)?;
                keys.insert(data.idempotency_key.clone(), created.key.clone());
                Ok(CommandOutcome {
                    key: created.key,
                    url: created.url,
                    comment_id: None,
                })
            }
            Command::CreateSubtask { parent, data, .. } => {
                let parent_key = keys.resolve(parent).ok_or_else(|| unresolved(parent))?;
                let created = tracker.create_subtask(&parent_key, data)?;
                keys.insert(data.idempotency_key.clone(), created.key.clone());
                Ok(CommandOutcome {
                    key: created.key,
                    url: created.url,
                    comment_id: None,
                })
            }
            Command::UpdateDescription { target, after, .. } => {
                let key = keys.resolve(target).ok_or_else(|| unresolved(target))?;
                tracker.update_story(&key, &FieldUpdate::description(after.clone()))?;
                Ok(CommandOutcome::at(key))
            }
            Command::UpdateStoryPoints { target, after, .. } => {
                let key = keys.resolve(target).ok_or_else(|| unresolved(target))?;
                tracker.update_story(&key, &FieldUpdate::story_points(*after))?;
                Ok(CommandOutcome::at(key))
            }
            Command::UpdateSubtask { target, after, .. } => {
                let key = keys.resolve(target).ok_or_else(|| unresolved(target))?;
                tracker.update_subtask(&key, &FieldUpdate::description(after.clone()))?;
                Ok(CommandOutcome::at(key))
            }
            Command::TransitionStatus { target, after, .. } => {
                let key = keys.resolve(target).ok_or_else(|| unresolved(target))?;
                tracker.transition_status(&key, *after)?;
                Ok(CommandOutcome::at(key))
            }
            Command::AddComment { target, body, .. } => {
                let key = keys.resolve(target).ok_or_else(|| unresolved(target))?;
                let id = tracker.add_comment(&key, body)?;
                Ok(CommandOutcome {
                    key,
                    url: None,
                    comment_id: Some(id),
                })
            }
            Command::DeleteSubtask { target, .. } => {
                let key = keys.resolve(target).ok_or_else(|| unresolved(target))?;
                tracker.delete_issue(&key)?;
                Ok(CommandOutcome::at(key))
            }
            Command::DeleteComment {
                target, comment_id, ..
            } => {
                let key = keys.resolve(target).ok_or_else(|| unresolved(target))?;
                tracker.delete_comment(&key, comment_id)?;
                Ok(CommandOutcome {
                    key,
                    url: None,
                    comment_id: Some(comment_id.clone()),
                })
            }
        }
    }

    /// Reverse a successful `execute`. Creates and comments need the
    /// tracker's delete support and fail with `Unsupported` without it.
    /// Deletes are reversed by recreating the content, which gets a new key
    /// or comment id.
    pub fn undo(&self, tracker: &dyn Tracker, outcome: &CommandOutcome) -> Result<(), TrackerError> {
        match self {
            Command::CreateStory { .. } | Command::CreateSubtask { .. } => {
                tracker.delete_issue(&outcome.key)
            }
            Command::UpdateDescription { before, .. } => {
                tracker.update_story(&outcome.key, &FieldUpdate::description(before.clone()))
            }
            Command::UpdateStoryPoints { before, .. } => {
                tracker.update_story(&outcome.key, &FieldUpdate::story_points(*before))
            }
            Command::UpdateSubtask { before, .. } => {
                tracker.update_subtask(&outcome.key, &FieldUpdate::description(before.clone()))
            }
            Command::TransitionStatus { before, .. } => {
                tracker.transition_status(&outcome.key, *before)
            }
            Command::AddComment { .. } => match &outcome.comment_id {
                Some(id) => tracker.delete_comment(&outcome.key, id),
                None => Err(TrackerError::Unsupported {
                    operation: "delete_comment",
                }),
            },
            Command::DeleteSubtask { parent, data, .. } => {
                tracker.create_subtask(parent, data).map(|_| ())
            }
            Command::DeleteComment { body, .. } => {
                tracker.add_comment(&outcome.key, body).map(|_| ())
            }
        }
    }

    /// The outcome a dry run reports: resolved target, or a `PENDING-<hint>`
    /// placeholder for issues that would be created.
    pub fn simulate(&self, keys: &mut LaneKeys) -> CommandOutcome {
        if let Some(hint) = self.creates() {
            let key = IssueKey(format!("PENDING-{hint}"));
            keys.insert(hint, key.clone());
            return CommandOutcome::at(key);
        }
        let target = self.target();
        let key = keys
            .resolve(&target)
            .unwrap_or_else(|| IssueKey(format!("PENDING-{target}")));
        CommandOutcome::at(key)
    }
}

fn points(value: Option<u32>) -> String {
    value.map_or_else(|| "none".to_string(), |p| p.to_string())
}

fn excerpt(body: &str) -> String {
    let line = body.lines().next().unwrap_or_default().trim();
    if line.chars().count() > 40 {
        let cut: String = line.chars().take(40).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
