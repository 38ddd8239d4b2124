//! Roundtrip serialisation tests for `epicsync-core` document types.
//!
//! Each `#[case]` is isolated: no shared state.

use chrono::Utc;
use epicsync_core::types::{
    Comment, Description, Epic, IssueKey, Priority, Status, Story, StoryId, Subtask,
};
use epicsync_core::{DocumentParser, YamlParser};
use rstest::rstest;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn minimal_epic() -> Epic {
    Epic {
        key: IssueKey::from("PROJ-1"),
        title: "Empty".to_string(),
        stories: vec![],
    }
}

fn full_epic() -> Epic {
    Epic {
        key: IssueKey::from("PROJ-1"),
        title: "Authentication".to_string(),
        stories: vec![Story {
            id: StoryId::from("US-1"),
            title: "Login".to_string(),
            description: Description::Structured {
                role: "user".to_string(),
                want: "to log in".to_string(),
                benefit: "I can see my data".to_string(),
            },
            priority: Priority::High,
            status: Status::InProgress,
            story_points: Some(5),
            subtasks: vec![Subtask {
                id: StoryId::from("ST-1"),
                title: "Build form".to_string(),
                description: "HTML + validation".to_string(),
                status: Status::Done,
                external_key: Some(IssueKey::from("PROJ-3")),
            }],
            comments: vec![Comment {
                author: "alice".to_string(),
                timestamp: Utc::now(),
                body: "Looks good".to_string(),
                external_id: Some("c-1".to_string()),
            }],
            external_key: Some(IssueKey::from("PROJ-2")),
            external_url: Some("https://tracker.example/PROJ-2".to_string()),
            last_synced_hash: Some("deadbeef".to_string()),
        }],
    }
}

fn unicode_epic() -> Epic {
    let mut story = Story::new("US-🚀", "Ünïcödé story: <>&\"'");
    story.description = Description::Text("日本語・한국어・العربية".to_string());
    Epic {
        key: IssueKey::from("ПРОЕКТ-1"),
        title: "项目".to_string(),
        stories: vec![story],
    }
}

// ---------------------------------------------------------------------------
// Parameterised roundtrip test
// ---------------------------------------------------------------------------

#[rstest]
#[case("minimal", minimal_epic())]
#[case("all_fields", full_epic())]
#[case("unicode_strings", unicode_epic())]
fn epic_roundtrip(#[case] label: &str, #[case] epic: Epic) {
    let yaml =
        serde_yaml::to_string(&epic).unwrap_or_else(|e| panic!("[{label}] serialize failed: {e}"));
    let back = YamlParser
        .parse(&yaml)
        .unwrap_or_else(|e| panic!("[{label}] parse failed: {e}"));
    assert_eq!(epic, back, "[{label}] epic");
}

// ---------------------------------------------------------------------------
// Status spellings accepted in documents
// ---------------------------------------------------------------------------

#[rstest]
#[case("open", Status::Open)]
#[case("todo", Status::Open)]
#[case("in_progress", Status::InProgress)]
#[case("in-progress", Status::InProgress)]
#[case("review", Status::InReview)]
#[case("closed", Status::Done)]
#[case("canceled", Status::Cancelled)]
fn status_spellings(#[case] raw: &str, #[case] expected: Status) {
    let yaml = format!("id: US-1\ntitle: t\nstatus: {raw}\n");
    let story: Story = serde_yaml::from_str(&yaml).expect("deserialize");
    assert_eq!(story.status, expected);
}
