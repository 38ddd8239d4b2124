//! `epicsync backup list|show|diff|prune`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use epicsync_core::IssueKey;
use epicsync_sync::backup::IssueSnapshot;
use epicsync_sync::{BackupId, ExitCode};

use super::{backup_store, Session, TrackerArgs};

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// List backups, newest first.
    List(ListArgs),

    /// Print the issues captured by one backup.
    Show(ShowArgs),

    /// Show field-level differences between a backup and the tracker now.
    Diff(DiffArgs),

    /// Delete all but the newest backups of an epic.
    Prune(PruneArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only backups of this epic.
    #[arg(long)]
    pub epic: Option<String>,

    /// Config file to use instead of `~/.epicsync/config.yaml`.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub id: String,

    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    pub id: String,

    #[command(flatten)]
    pub tracker: TrackerArgs,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    #[arg(long)]
    pub epic: String,

    /// Number of backups to keep.
    #[arg(long)]
    pub keep: usize,

    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "epic")]
    epic: String,
    #[tabled(rename = "created")]
    created: String,
    #[tabled(rename = "issues")]
    issues: usize,
}

pub fn run(cmd: BackupCommand) -> Result<ExitCode> {
    match cmd {
        BackupCommand::List(args) => list(args),
        BackupCommand::Show(args) => show(args),
        BackupCommand::Diff(args) => diff(args),
        BackupCommand::Prune(args) => prune(args),
    }
}

fn list(args: ListArgs) -> Result<ExitCode> {
    let store = backup_store(args.config.as_deref())?;
    let epic = args.epic.map(IssueKey::from);
    let backups = store.list(epic.as_ref()).context("failed to list backups")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(ExitCode::Success);
    }
    if backups.is_empty() {
        println!("No backups found.");
        return Ok(ExitCode::Success);
    }

    let rows: Vec<BackupRow> = backups
        .into_iter()
        .map(|b| BackupRow {
            id: b.id.to_string(),
            epic: b.epic.to_string(),
            created: b.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            issues: b.issue_count,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(ExitCode::Success)
}

fn show(args: ShowArgs) -> Result<ExitCode> {
    let store = backup_store(args.config.as_deref())?;
    let id = BackupId::from(args.id.as_str());
    let backup = store.load(&id).with_context(|| format!("failed to load backup {id}"))?;

    println!(
        "{} of {} taken {}",
        backup.id.to_string().bold(),
        backup.epic,
        backup.created_at.to_rfc3339()
    );
    for issue in &backup.issues {
        print_snapshot(issue, 1);
    }
    Ok(ExitCode::Success)
}

fn print_snapshot(issue: &IssueSnapshot, depth: usize) {
    let indent = "  ".repeat(depth);
    let points = issue
        .story_points
        .map(|p| format!(", {p} pts"))
        .unwrap_or_default();
    println!("{indent}{} {} [{}{points}]", issue.key, issue.summary, issue.status);
    for sub in &issue.subtasks {
        print_snapshot(sub, depth + 1);
    }
}

fn diff(args: DiffArgs) -> Result<ExitCode> {
    let session = Session::open(&args.tracker)?;
    let id = BackupId::from(args.id.as_str());
    let changes = session
        .backups()
        .diff(&id, session.tracker.as_ref())
        .with_context(|| format!("diff against backup {id} failed"))?;

    if changes.is_empty() {
        println!("No differences since backup {id}.");
        return Ok(ExitCode::Success);
    }
    for change in changes {
        let text = change.unified_diff();
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(ExitCode::Success)
}

fn prune(args: PruneArgs) -> Result<ExitCode> {
    let store = backup_store(args.config.as_deref())?;
    let epic = IssueKey::from(args.epic.as_str());
    let removed = store
        .prune(&epic, args.keep)
        .with_context(|| format!("failed to prune backups of {epic}"))?;

    if removed.is_empty() {
        println!("Nothing to prune for {epic}.");
    } else {
        println!("✓ removed {} backup(s) of {epic}", removed.len());
        for id in removed {
            println!("  ✗  {id}");
        }
    }
    Ok(ExitCode::Success)
}
