//! Bidirectional divergence detection and resolution.

use serde::Serialize;

use epicsync_core::config::ConflictStrategy;
use epicsync_core::issue::{IssueFields, TrackerIssue};
use epicsync_core::types::{Description, IssueKey, Story, StoryId};

use crate::hash::{normalize_text, story_hash};
use crate::sync_state::StoryState;

/// Which side moved since the last sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Unchanged,
    LocalOnly,
    RemoteOnly,
    Both,
}

/// Classify one matched pair. A story with no recorded state counts as
/// locally changed: there is nothing to compare the remote side against.
pub fn classify(story: &Story, issue: &TrackerIssue, recorded: Option<&StoryState>) -> ChangeState {
    let Some(recorded) = recorded else {
        return ChangeState::LocalOnly;
    };
    let baseline = story
        .last_synced_hash
        .as_deref()
        .unwrap_or(&recorded.local_hash);
    let local = story_hash(story) != baseline;
    let remote = issue.updated != recorded.remote_updated;
    match (local, remote) {
        (false, false) => ChangeState::Unchanged,
        (true, false) => ChangeState::LocalOnly,
        (false, true) => ChangeState::RemoteOnly,
        (true, true) => ChangeState::Both,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merged,
    /// `ask`: nothing written, left for the user.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub story: StoryId,
    pub issue: IssueKey,
    pub local: IssueFields,
    pub remote: IssueFields,
    pub resolution: Resolution,
    /// Values written to both sides for `merge`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<IssueFields>,
}

/// What to do with one story in a bidirectional run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub state: ChangeState,
    /// Push the (possibly merged) local story to the tracker.
    pub push: bool,
    /// Local values to plan from instead of the document's, for `merge`.
    pub push_fields: Option<IssueFields>,
    /// Remote values to apply to the document.
    pub pull: Option<IssueFields>,
    pub conflict: Option<ConflictRecord>,
}

impl Decision {
    fn push(state: ChangeState) -> Self {
        Self {
            state,
            push: true,
            push_fields: None,
            pull: None,
            conflict: None,
        }
    }
}

/// Local value where the document has one, remote otherwise.
pub fn merge(local: &IssueFields, remote: &IssueFields) -> IssueFields {
    let pick = |l: &str, r: &str| {
        if l.trim().is_empty() {
            r.to_string()
        } else {
            l.to_string()
        }
    };
    IssueFields {
        summary: pick(&local.summary, &remote.summary),
        description: pick(&local.description, &remote.description),
        status: local.status,
        priority: local.priority.or(remote.priority),
        story_points: local.story_points.or(remote.story_points),
    }
}

/// Decide push/pull for a matched pair under `strategy`.
pub fn resolve(
    story: &Story,
    issue: &TrackerIssue,
    recorded: Option<&StoryState>,
    strategy: ConflictStrategy,
) -> Decision {
    let state = classify(story, issue, recorded);
    match state {
        ChangeState::Unchanged | ChangeState::LocalOnly => Decision::push(state),
        ChangeState::RemoteOnly => Decision {
            state,
            push: false,
            push_fields: None,
            pull: Some(issue.fields()),
            conflict: None,
        },
        ChangeState::Both => {
            let local = IssueFields::from_story(story);
            let remote = issue.fields();
            let record = |resolution, merged| ConflictRecord {
                story: story.id.clone(),
                issue: issue.key.clone(),
                local: local.clone(),
                remote: remote.clone(),
                resolution,
                merged,
            };
            match strategy {
                ConflictStrategy::Local => Decision {
                    conflict: Some(record(Resolution::LocalWins, None)),
                    ..Decision::push(state)
                },
                ConflictStrategy::Remote => Decision {
                    state,
                    push: false,
                    push_fields: None,
                    pull: Some(remote.clone()),
                    conflict: Some(record(Resolution::RemoteWins, None)),
                },
                ConflictStrategy::Merge => {
                    let merged = merge(&local, &remote);
                    Decision {
                        state,
                        push: true,
                        push_fields: Some(merged.clone()),
                        pull: Some(merged.clone()),
                        conflict: Some(record(Resolution::Merged, Some(merged))),
                    }
                }
                ConflictStrategy::Ask => Decision {
                    state,
                    push: false,
                    push_fields: None,
                    pull: None,
                    conflict: Some(record(Resolution::Unresolved, None)),
                },
            }
        }
    }
}

/// Overwrite a story's syncable fields with tracker values.
pub fn apply_fields(story: &mut Story, fields: &IssueFields) {
    story.title = fields.summary.clone();
    if normalize_text(&story.description.render()) != normalize_text(&fields.description) {
        story.description = Description::Text(fields.description.clone());
    }
    story.status = fields.status;
    story.story_points = fields.story_points;
    if let Some(priority) = fields.priority {
        story.priority = priority;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epicsync_core::types::{Priority, Status};

    fn issue(updated: &str, description: &str) -> TrackerIssue {
        TrackerIssue {
            key: IssueKey::from("PROJ-1"),
            summary: "Login".into(),
            description: description.into(),
            status: Status::Open,
            priority: Some(Priority::Medium),
            story_points: Some(2),
            subtasks: vec![],
            comments: vec![],
            url: None,
            updated: updated.into(),
        }
    }

    fn synced(story: &Story, updated: &str) -> StoryState {
        StoryState {
            issue_key: IssueKey::from("PROJ-1"),
            local_hash: story_hash(story),
            remote_updated: updated.into(),
        }
    }

    #[test]
    fn four_cases() {
        let story = Story::new("US-1", "Login");
        let state = synced(&story, "rev-1");
        let mut edited = story.clone();
        edited.story_points = Some(5);

        assert_eq!(classify(&story, &issue("rev-1", ""), Some(&state)), ChangeState::Unchanged);
        assert_eq!(classify(&edited, &issue("rev-1", ""), Some(&state)), ChangeState::LocalOnly);
        assert_eq!(classify(&story, &issue("rev-2", ""), Some(&state)), ChangeState::RemoteOnly);
        assert_eq!(classify(&edited, &issue("rev-2", ""), Some(&state)), ChangeState::Both);
    }

    #[test]
    fn no_recorded_state_is_local_only() {
        let story = Story::new("US-1", "Login");
        assert_eq!(classify(&story, &issue("rev-9", ""), None), ChangeState::LocalOnly);
    }

    #[test]
    fn document_hash_takes_precedence_over_store() {
        let story = Story::new("US-1", "Login");
        let mut state = synced(&story, "rev-1");
        state.local_hash = "stale".into();
        let mut with_hash = story.clone();
        with_hash.last_synced_hash = Some(story_hash(&story));
        assert_eq!(
            classify(&with_hash, &issue("rev-1", ""), Some(&state)),
            ChangeState::Unchanged
        );
    }

    #[test]
    fn ask_neither_pushes_nor_pulls() {
        let story = Story::new("US-1", "Login");
        let state = synced(&story, "rev-1");
        let mut edited = story.clone();
        edited.description = Description::Text("local".into());
        let decision = resolve(&edited, &issue("rev-2", "remote"), Some(&state), ConflictStrategy::Ask);
        assert!(!decision.push);
        assert!(decision.pull.is_none());
        assert_eq!(decision.conflict.unwrap().resolution, Resolution::Unresolved);
    }

    #[test]
    fn merge_prefers_non_empty_local_fields() {
        let mut local = IssueFields::from_story(&Story::new("US-1", "Login"));
        local.description = "  ".into();
        local.story_points = None;
        let remote = IssueFields {
            summary: "Remote title".into(),
            description: "remote body".into(),
            status: Status::Done,
            priority: None,
            story_points: Some(8),
        };
        let merged = merge(&local, &remote);
        assert_eq!(merged.summary, "Login");
        assert_eq!(merged.description, "remote body");
        assert_eq!(merged.story_points, Some(8));
        assert_eq!(merged.status, local.status);
    }

    #[test]
    fn remote_only_pulls() {
        let story = Story::new("US-1", "Login");
        let state = synced(&story, "rev-1");
        let decision = resolve(&story, &issue("rev-2", "remote"), Some(&state), ConflictStrategy::Ask);
        assert_eq!(decision.state, ChangeState::RemoteOnly);
        assert!(!decision.push);
        assert_eq!(decision.pull.unwrap().description, "remote");
        assert!(decision.conflict.is_none());
    }
}
