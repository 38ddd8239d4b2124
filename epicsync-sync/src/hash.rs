//! Content hashing for stories.
//!
//! The hash covers everything the engine pushes (title, rendered description,
//! priority, status, points, subtasks, comment bodies) and nothing it writes
//! back (external keys, URLs, the stored hash itself), so a writeback never
//! makes a story look locally modified.

use serde::Serialize;
use sha2::{Digest, Sha256};

use epicsync_core::types::{Priority, Status, Story};

#[derive(Serialize)]
struct SubtaskView<'a> {
    id: &'a str,
    title: &'a str,
    description: String,
    status: Status,
}

#[derive(Serialize)]
struct StoryView<'a> {
    id: &'a str,
    title: &'a str,
    description: String,
    priority: Priority,
    status: Status,
    story_points: Option<u32>,
    subtasks: Vec<SubtaskView<'a>>,
    comments: Vec<String>,
}

/// Line-ending and edge-whitespace normalisation applied before hashing
/// and before comparing text fields with the tracker.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// SHA-256 hex digest of a story's syncable content.
pub fn story_hash(story: &Story) -> String {
    let view = StoryView {
        id: story.id.as_str(),
        title: story.title.trim(),
        description: normalize_text(&story.description.render()),
        priority: story.priority,
        status: story.status,
        story_points: story.story_points,
        subtasks: story
            .subtasks
            .iter()
            .map(|s| SubtaskView {
                id: s.id.as_str(),
                title: s.title.trim(),
                description: normalize_text(&s.description),
                status: s.status,
            })
            .collect(),
        comments: story.comments.iter().map(|c| normalize_text(&c.body)).collect(),
    };
    // Serialising a plain struct of strings and enums cannot fail.
    let canonical = serde_json::to_string(&view).unwrap_or_default();
    let mut h = Sha256::new();
    h.update(canonical.as_bytes());
    hex::encode(h.finalize())
}
