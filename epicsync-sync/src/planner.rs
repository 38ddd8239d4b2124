//! Field-by-field diff of a story against its tracker issue.
//!
//! The planner never talks to the tracker. It reads the document story and
//! the fetched issue and emits the commands that close the gap for one
//! phase. A story that already matches emits nothing.

use epicsync_core::config::Phase;
use epicsync_core::issue::{NewIssue, TrackerIssue};
use epicsync_core::types::{IssueKey, Status, Story};

use crate::command::{Command, IssueRef};
use crate::hash::normalize_text;
use crate::matcher::Matcher;

#[derive(Debug)]
pub struct Planner<'a> {
    epic: IssueKey,
    /// Creates are emitted in this phase only.
    first: Option<Phase>,
    matcher: &'a Matcher,
}

impl<'a> Planner<'a> {
    pub fn new(epic: &IssueKey, phases: &[Phase], matcher: &'a Matcher) -> Self {
        Self {
            epic: epic.clone(),
            first: Phase::ordered(phases).first().copied(),
            matcher,
        }
    }

    /// Commands for `story` in `phase`. `issue` is `None` when the story is
    /// unmatched.
    pub fn plan(&self, phase: Phase, story: &Story, issue: Option<&TrackerIssue>) -> Vec<Command> {
        match issue {
            Some(issue) => match phase {
                Phase::Descriptions => self.descriptions(story, issue),
                Phase::Subtasks => self.subtasks(story, issue),
                Phase::Comments => self.comments(story, issue),
                Phase::Statuses => self.statuses(story, issue),
            },
            None if self.first == Some(phase) => self.creation(phase, story),
            None => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Unmatched stories
    // -----------------------------------------------------------------------

    /// Story, then every subtask under the pending story, then whatever the
    /// first phase itself contributes for a fresh issue.
    fn creation(&self, phase: Phase, story: &Story) -> Vec<Command> {
        let parent = IssueRef::pending_story(&story.id);
        let mut commands = vec![Command::CreateStory {
            story: story.id.clone(),
            epic: self.epic.clone(),
            data: NewIssue::from_story(story),
        }];
        commands.extend(story.subtasks.iter().map(|sub| Command::CreateSubtask {
            story: story.id.clone(),
            subtask: sub.id.clone(),
            parent: parent.clone(),
            data: NewIssue::from_subtask(story, sub),
        }));

        match phase {
            Phase::Comments => {
                commands.extend(story.comments.iter().map(|c| Command::AddComment {
                    story: story.id.clone(),
                    target: parent.clone(),
                    body: c.body.clone(),
                }));
            }
            Phase::Statuses => {
                if story.status != Status::Open {
                    commands.push(Command::TransitionStatus {
                        story: story.id.clone(),
                        subtask: None,
                        target: parent.clone(),
                        before: Status::Open,
                        after: story.status,
                    });
                }
                for sub in story.subtasks.iter().filter(|s| s.status != Status::Open) {
                    commands.push(Command::TransitionStatus {
                        story: story.id.clone(),
                        subtask: Some(sub.id.clone()),
                        target: IssueRef::pending_subtask(&story.id, &sub.id),
                        before: Status::Open,
                        after: sub.status,
                    });
                }
            }
            Phase::Descriptions | Phase::Subtasks => {}
        }
        commands
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    fn descriptions(&self, story: &Story, issue: &TrackerIssue) -> Vec<Command> {
        let target = IssueRef::Key(issue.key.clone());
        let mut commands = Vec::new();
        let local = story.description.render();
        if normalize_text(&local) != normalize_text(&issue.description) {
            commands.push(Command::UpdateDescription {
                story: story.id.clone(),
                target: target.clone(),
                before: issue.description.clone(),
                after: local,
            });
        }
        if story.story_points != issue.story_points {
            commands.push(Command::UpdateStoryPoints {
                story: story.id.clone(),
                target,
                before: issue.story_points,
                after: story.story_points,
            });
        }
        commands
    }

    fn subtasks(&self, story: &Story, issue: &TrackerIssue) -> Vec<Command> {
        let results = self.matcher.match_subtasks(&story.subtasks, &issue.subtasks);
        let mut commands = Vec::new();
        for (sub, result) in story.subtasks.iter().zip(&results) {
            match result.issue.as_ref().and_then(|key| issue.subtask(key)) {
                None => commands.push(Command::CreateSubtask {
                    story: story.id.clone(),
                    subtask: sub.id.clone(),
                    parent: IssueRef::Key(issue.key.clone()),
                    data: NewIssue::from_subtask(story, sub),
                }),
                Some(remote) => {
                    if normalize_text(&sub.description) != normalize_text(&remote.description) {
                        commands.push(Command::UpdateSubtask {
                            story: story.id.clone(),
                            subtask: sub.id.clone(),
                            target: IssueRef::Key(remote.key.clone()),
                            before: remote.description.clone(),
                            after: sub.description.trim().to_string(),
                        });
                    }
                }
            }
        }
        commands
    }

    fn comments(&self, story: &Story, issue: &TrackerIssue) -> Vec<Command> {
        story
            .comments
            .iter()
            .filter(|local| {
                let body = normalize_text(&local.body);
                !issue.comments.iter().any(|remote| {
                    local.external_id.as_deref() == Some(remote.id.as_str())
                        || normalize_text(&remote.body) == body
                })
            })
            .map(|local| Command::AddComment {
                story: story.id.clone(),
                target: IssueRef::Key(issue.key.clone()),
                body: local.body.clone(),
            })
            .collect()
    }

    fn statuses(&self, story: &Story, issue: &TrackerIssue) -> Vec<Command> {
        let mut commands = Vec::new();
        if story.status != issue.status {
            commands.push(Command::TransitionStatus {
                story: story.id.clone(),
                subtask: None,
                target: IssueRef::Key(issue.key.clone()),
                before: issue.status,
                after: story.status,
            });
        }
        let results = self.matcher.match_subtasks(&story.subtasks, &issue.subtasks);
        for (sub, result) in story.subtasks.iter().zip(&results) {
            let Some(remote) = result.issue.as_ref().and_then(|key| issue.subtask(key)) else {
                continue;
            };
            if sub.status != remote.status {
                commands.push(Command::TransitionStatus {
                    story: story.id.clone(),
                    subtask: Some(sub.id.clone()),
                    target: IssueRef::Key(remote.key.clone()),
                    before: remote.status,
                    after: sub.status,
                });
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use epicsync_core::issue::TrackerComment;
    use epicsync_core::types::{Comment, Description, Subtask};

    fn remote(key: &str, summary: &str) -> TrackerIssue {
        TrackerIssue {
            key: IssueKey::from(key),
            summary: summary.into(),
            description: String::new(),
            status: Status::Open,
            priority: None,
            story_points: None,
            subtasks: vec![],
            comments: vec![],
            url: None,
            updated: "rev-1".into(),
        }
    }

    fn subtask(id: &str, title: &str) -> Subtask {
        Subtask {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: Status::Open,
            external_key: None,
        }
    }

    fn comment(body: &str) -> Comment {
        Comment {
            author: "alice".into(),
            timestamp: Utc::now(),
            body: body.into(),
            external_id: None,
        }
    }

    fn planner(matcher: &Matcher) -> Planner<'_> {
        Planner::new(&IssueKey::from("EPIC-1"), Phase::all(), matcher)
    }

    #[test]
    fn unmatched_story_creates_story_then_subtasks() {
        let matcher = Matcher::default();
        let mut story = Story::new("US-1", "Login");
        story.subtasks = vec![subtask("ST-1", "Form"), subtask("ST-2", "Tests")];

        let commands = planner(&matcher).plan(Phase::Descriptions, &story, None);
        let kinds: Vec<_> = commands.iter().map(Command::kind).collect();
        assert_eq!(kinds, ["create_story", "create_subtask", "create_subtask"]);
        assert_eq!(commands[1].target(), IssueRef::Pending("US-1".into()));
    }

    #[test]
    fn unmatched_story_is_created_only_in_first_phase() {
        let matcher = Matcher::default();
        let story = Story::new("US-1", "Login");
        assert!(planner(&matcher).plan(Phase::Statuses, &story, None).is_empty());
    }

    #[test]
    fn statuses_only_run_transitions_fresh_issue() {
        let matcher = Matcher::default();
        let planner = Planner::new(&IssueKey::from("EPIC-1"), &[Phase::Statuses], &matcher);
        let mut story = Story::new("US-1", "Login");
        story.status = Status::InProgress;
        let mut sub = subtask("ST-1", "Form");
        sub.status = Status::Done;
        story.subtasks = vec![sub];

        let commands = planner.plan(Phase::Statuses, &story, None);
        let kinds: Vec<_> = commands.iter().map(Command::kind).collect();
        assert_eq!(
            kinds,
            ["create_story", "create_subtask", "transition_status", "transition_status"]
        );
        assert_eq!(commands[3].target(), IssueRef::Pending("US-1/ST-1".into()));
    }

    #[test]
    fn in_sync_story_emits_nothing() {
        let matcher = Matcher::default();
        let mut story = Story::new("US-1", "Login");
        story.description = Description::Text("Users sign in.".into());
        story.story_points = Some(3);
        story.comments = vec![comment("Looks good")];
        story.subtasks = vec![subtask("ST-1", "Form")];

        let mut issue = remote("PROJ-1", "Login");
        issue.description = "Users sign in.\r\n".into();
        issue.story_points = Some(3);
        issue.comments = vec![TrackerComment {
            id: "c-1".into(),
            body: "Looks good".into(),
        }];
        issue.subtasks = vec![remote("PROJ-2", "Form")];

        let planner = planner(&matcher);
        for phase in Phase::all() {
            assert!(
                planner.plan(*phase, &story, Some(&issue)).is_empty(),
                "{phase} should be a no-op"
            );
        }
    }

    #[test]
    fn description_and_points_diffs() {
        let matcher = Matcher::default();
        let mut story = Story::new("US-1", "Login");
        story.description = Description::Text("new".into());
        story.story_points = Some(5);
        let mut issue = remote("PROJ-1", "Login Page");
        issue.description = "old".into();
        issue.story_points = Some(3);

        let commands = planner(&matcher).plan(Phase::Descriptions, &story, Some(&issue));
        assert_eq!(
            commands,
            vec![
                Command::UpdateDescription {
                    story: "US-1".into(),
                    target: IssueRef::Key("PROJ-1".into()),
                    before: "old".into(),
                    after: "new".into(),
                },
                Command::UpdateStoryPoints {
                    story: "US-1".into(),
                    target: IssueRef::Key("PROJ-1".into()),
                    before: Some(3),
                    after: Some(5),
                },
            ]
        );
    }

    #[test]
    fn subtasks_create_missing_and_update_changed() {
        let matcher = Matcher::default();
        let mut story = Story::new("US-1", "Login");
        let mut form = subtask("ST-1", "Form");
        form.description = "validate input".into();
        story.subtasks = vec![form, subtask("ST-2", "Database migration")];

        let mut issue = remote("PROJ-1", "Login");
        issue.subtasks = vec![remote("PROJ-2", "Form")];

        let commands = planner(&matcher).plan(Phase::Subtasks, &story, Some(&issue));
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            &commands[0],
            Command::UpdateSubtask { target: IssueRef::Key(k), after, .. }
                if k.as_str() == "PROJ-2" && after == "validate input"
        ));
        assert!(matches!(
            &commands[1],
            Command::CreateSubtask { parent: IssueRef::Key(k), subtask, .. }
                if k.as_str() == "PROJ-1" && subtask.as_str() == "ST-2"
        ));
    }

    #[test]
    fn comments_match_by_external_id_or_body() {
        let matcher = Matcher::default();
        let mut story = Story::new("US-1", "Login");
        let mut edited = comment("edited locally");
        edited.external_id = Some("c-7".into());
        story.comments = vec![edited, comment("  Same body "), comment("brand new")];

        let mut issue = remote("PROJ-1", "Login");
        issue.comments = vec![
            TrackerComment {
                id: "c-7".into(),
                body: "original".into(),
            },
            TrackerComment {
                id: "c-8".into(),
                body: "Same body".into(),
            },
        ];

        let commands = planner(&matcher).plan(Phase::Comments, &story, Some(&issue));
        assert_eq!(commands.len(), 1);
        assert!(matches!(&commands[0], Command::AddComment { body, .. } if body == "brand new"));
    }

    #[test]
    fn statuses_cover_story_and_matched_subtasks() {
        let matcher = Matcher::default();
        let mut story = Story::new("US-1", "Login");
        story.status = Status::Done;
        let mut form = subtask("ST-1", "Form");
        form.status = Status::Done;
        story.subtasks = vec![form, subtask("ST-2", "Unrelated backlog item")];

        let mut issue = remote("PROJ-1", "Login");
        issue.subtasks = vec![remote("PROJ-2", "Form")];

        let commands = planner(&matcher).plan(Phase::Statuses, &story, Some(&issue));
        let targets: Vec<_> = commands.iter().map(|c| c.target().to_string()).collect();
        assert_eq!(targets, ["PROJ-1", "PROJ-2"]);
    }
}
