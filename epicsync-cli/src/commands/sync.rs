//! `epicsync sync`: reconcile one epic document with the tracker.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use epicsync_core::document::NoopWriteback;
use epicsync_core::{
    ConflictStrategy, Phase, SimilarityKind, SyncConfig, Writeback, YamlWriteback,
};
use epicsync_sync::{ExitCode, Governor, Resolution, SyncOptions, SyncOrchestrator, SyncResult};

use super::{home_dir, read_document, Session, TrackerArgs};

/// Arguments for `epicsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// YAML epic document to sync.
    pub document: PathBuf,

    #[command(flatten)]
    pub tracker: TrackerArgs,

    /// Phases to run, comma separated. Defaults to all of them.
    #[arg(long, value_delimiter = ',', value_name = "PHASE")]
    pub phases: Vec<Phase>,

    /// Plan and print commands without writing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Also pull remote edits back into the document.
    #[arg(long)]
    pub bidirectional: bool,

    /// Conflict resolution for bidirectional runs: local | remote | merge | ask.
    #[arg(long, value_name = "STRATEGY")]
    pub strategy: Option<ConflictStrategy>,

    /// Minimum fuzzy-title score in [0, 1].
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Title similarity: jaro-winkler | char-ratio.
    #[arg(long, value_name = "FUNCTION")]
    pub similarity: Option<SimilarityKind>,

    /// Worker threads per phase.
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Undo a phase's writes if any of its commands fails.
    #[arg(long)]
    pub transactional: bool,

    /// Skip the pre-sync backup.
    #[arg(long)]
    pub no_backup: bool,

    /// Emit the run result as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<ExitCode> {
        let home = home_dir()?;
        let mut config = self.tracker.load_config(&home)?;
        self.apply(&mut config);
        let session = Session::with_config(home, config)?;

        let mut epic = read_document(&self.document)?;
        let mut writeback: Box<dyn Writeback> = if self.dry_run {
            Box::new(NoopWriteback)
        } else {
            Box::new(
                YamlWriteback::open(&self.document)
                    .with_context(|| format!("failed to open {}", self.document.display()))?,
            )
        };

        let mut options = SyncOptions::from_config(&session.config);
        options.dry_run = self.dry_run;
        let orchestrator = SyncOrchestrator::new(session.tracker.as_ref(), options)
            .with_governor(Governor::system(&session.config))
            .with_backups(session.backups())
            .with_state_dir(session.data_dir());

        let result = orchestrator
            .run(&mut epic, writeback.as_mut())
            .with_context(|| format!("sync of {} failed", self.document.display()))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_result(&result);
        }
        Ok(result.exit_code())
    }

    fn apply(&self, config: &mut SyncConfig) {
        if !self.phases.is_empty() {
            config.phases = Phase::ordered(&self.phases);
        }
        if self.bidirectional {
            config.bidirectional = true;
        }
        if let Some(strategy) = self.strategy {
            config.conflict_strategy = strategy;
        }
        if let Some(threshold) = self.threshold {
            config.matching.threshold = threshold;
        }
        if let Some(similarity) = self.similarity {
            config.matching.similarity = similarity;
        }
        if let Some(parallelism) = self.parallelism {
            config.execution.parallelism = parallelism;
        }
        if self.transactional {
            config.execution.transactional = true;
        }
        if self.no_backup {
            config.backup.enabled = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_result(result: &SyncResult) {
    let prefix = if result.dry_run { "[dry-run] " } else { "" };
    let counts = &result.counts;
    let mark = match result.exit_code() {
        ExitCode::Success => "✓".green().bold(),
        ExitCode::Partial => "!".yellow().bold(),
        _ => "✗".red().bold(),
    };

    println!(
        "{prefix}{mark} {} — {} matched, {} created, {} updated, {} skipped, {} failed",
        result.epic, counts.matched, counts.created, counts.updated, counts.skipped, counts.failed,
    );
    if let Some(id) = &result.backup_id {
        println!("  backup {id}");
    }

    for line in &result.previews {
        println!("  ~  {line}");
    }
    for pulled in &result.pulled {
        println!("  ←  {} pulled from {}", pulled.story, pulled.issue);
    }
    for conflict in &result.conflicts {
        let label = match conflict.resolution {
            Resolution::LocalWins => "local wins".normal(),
            Resolution::RemoteWins => "remote wins".normal(),
            Resolution::Merged => "merged".normal(),
            Resolution::Unresolved => "unresolved".yellow(),
        };
        println!("  ⇄  {} / {}: {label}", conflict.story, conflict.issue);
    }
    for error in &result.errors {
        let scope = match (&error.story, &error.command) {
            (Some(story), Some(command)) => format!("{story} {command}"),
            (Some(story), None) => story.to_string(),
            (None, Some(command)) => command.clone(),
            (None, None) => String::new(),
        };
        println!("  {}  {scope}: {}", "✗".red(), error.message);
    }

    if result.cancelled {
        println!("{}", "Cancelled; later phases did not run.".yellow());
    }
    if result.unresolved_conflicts() > 0 {
        println!("Re-run with --strategy local, remote or merge to settle open conflicts.");
    }
}
