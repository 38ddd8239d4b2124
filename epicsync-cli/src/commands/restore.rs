//! `epicsync restore <id>`: revert tracker fields to a backup.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use epicsync_sync::ratelimit::GovernedTracker;
use epicsync_sync::{BackupId, BatchOptions, ExitCode, Governor};

use super::{Session, TrackerArgs};

/// Arguments for `epicsync restore`.
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Backup id as printed by `epicsync backup list`.
    pub id: String,

    #[command(flatten)]
    pub tracker: TrackerArgs,

    /// Print the commands a restore would run without running them.
    #[arg(long)]
    pub dry_run: bool,
}

impl RestoreArgs {
    pub fn run(self) -> Result<ExitCode> {
        let session = Session::open(&self.tracker)?;
        let id = BackupId::from(self.id.as_str());
        let governor = Governor::system(&session.config);
        let tracker = GovernedTracker::new(session.tracker.as_ref(), &governor);

        let options = BatchOptions {
            parallelism: session.config.execution.parallelism,
            dry_run: self.dry_run,
            ..BatchOptions::default()
        };
        let report = session
            .backups()
            .restore(&id, &tracker, &options)
            .with_context(|| format!("restore of backup {id} failed"))?;

        let prefix = if self.dry_run { "[dry-run] " } else { "" };
        if report.executed.is_empty() && report.failed.is_empty() {
            println!("{prefix}✓ tracker already matches backup {id}");
            return Ok(ExitCode::Success);
        }
        for line in report.previews() {
            println!("  ~  {line}");
        }
        for failed in &report.failed {
            println!("  {}  {}: {}", "✗".red(), failed.command.preview(), failed.error);
        }

        let code = if report.failed.is_empty() {
            ExitCode::Success
        } else if report.executed.is_empty() {
            ExitCode::ApiFailure
        } else {
            ExitCode::Partial
        };
        println!(
            "{prefix}{} restored {} field(s) from {id}, {} failed",
            if code == ExitCode::Success { "✓".green() } else { "!".yellow() },
            report.executed.len(),
            report.failed.len(),
        );
        Ok(code)
    }
}
