//! `epicsync match`: read-only pairing preview.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use epicsync_core::{SimilarityKind, Tracker};
use epicsync_sync::ratelimit::GovernedTracker;
use epicsync_sync::{ExitCode, Governor, MatchMethod, MatchResult, Matcher};

use super::{home_dir, read_document, Session, TrackerArgs};

/// Arguments for `epicsync match`.
#[derive(Args, Debug)]
pub struct MatchArgs {
    /// YAML epic document to match.
    pub document: PathBuf,

    #[command(flatten)]
    pub tracker: TrackerArgs,

    /// Minimum fuzzy-title score in [0, 1].
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Title similarity: jaro-winkler | char-ratio.
    #[arg(long, value_name = "FUNCTION")]
    pub similarity: Option<SimilarityKind>,

    /// Emit the match results as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct MatchRow {
    #[tabled(rename = "story")]
    story: String,
    #[tabled(rename = "title")]
    title: String,
    #[tabled(rename = "issue")]
    issue: String,
    #[tabled(rename = "method")]
    method: String,
    #[tabled(rename = "confidence")]
    confidence: String,
}

impl MatchArgs {
    pub fn run(self) -> Result<ExitCode> {
        let home = home_dir()?;
        let mut config = self.tracker.load_config(&home)?;
        if let Some(threshold) = self.threshold {
            config.matching.threshold = threshold;
        }
        if let Some(similarity) = self.similarity {
            config.matching.similarity = similarity;
        }
        let session = Session::with_config(home, config)?;
        let epic = read_document(&self.document)?;

        let governor = Governor::system(&session.config);
        let tracker = GovernedTracker::new(session.tracker.as_ref(), &governor);
        let issues = tracker
            .fetch_epic_children(&epic.key)
            .with_context(|| format!("failed to fetch children of {}", epic.key))?;

        let matcher = Matcher::new(session.config.matching.threshold)
            .with_kind(session.config.matching.similarity);
        let results = matcher.match_stories(&epic.stories, &issues);

        if self.json {
            println!("{}", serde_json::to_string_pretty(&results)?);
            return Ok(ExitCode::Success);
        }

        let rows: Vec<MatchRow> = results
            .iter()
            .zip(&epic.stories)
            .map(|(result, story)| MatchRow {
                story: result.story.to_string(),
                title: story.title.clone(),
                issue: result
                    .issue
                    .as_ref()
                    .map_or_else(|| "—".to_string(), ToString::to_string),
                method: method_label(result),
                confidence: format!("{:.2}", result.confidence),
            })
            .collect();

        let unmatched = results.iter().filter(|r| !r.is_matched()).count();
        println!(
            "{} — {} stories, {} tracker issues, {} to create",
            epic.key.to_string().bold(),
            epic.stories.len(),
            issues.len(),
            unmatched,
        );
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(ExitCode::Success)
    }
}

fn method_label(result: &MatchResult) -> String {
    match result.method {
        MatchMethod::ExactKey => result.method.to_string().green().to_string(),
        MatchMethod::FuzzyTitle => result.method.to_string().yellow().to_string(),
        MatchMethod::Unmatched => result.method.to_string().bright_black().to_string(),
    }
}
