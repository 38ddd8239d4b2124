//! epicsync: reconcile a local epic document with an issue tracker.
//!
//! # Usage
//!
//! ```text
//! epicsync sync <document> [--dry-run] [--phases descriptions,statuses] [--bidirectional]
//!                          [--strategy local|remote|merge|ask] [--transactional] [--json]
//! epicsync match <document> [--threshold 0.75] [--similarity jaro-winkler|char-ratio] [--json]
//! epicsync backup list [--epic <key>] [--json]
//! epicsync backup show <id>
//! epicsync backup diff <id>
//! epicsync backup prune --epic <key> --keep <n>
//! epicsync restore <id> [--dry-run]
//! ```
//!
//! Tracker selection (`--tracker`, `--project`, `--tracker-path`) and
//! `--config` are accepted by every command that talks to a tracker.
//!
//! # Exit codes
//!
//! `0` success, `64` partial success, `8` API failure, `6` validation
//! failure, `80` cancelled.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

use commands::{
    backup::BackupCommand, matching::MatchArgs, restore::RestoreArgs, sync::SyncArgs,
};
use epicsync_core::error::{ConfigError, FormatError, RegistryError};
use epicsync_sync::{ExitCode, SyncError};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "epicsync",
    version,
    about = "Synchronize epic documents with an issue tracker",
    long_about = None,
)]
struct Cli {
    /// Log engine activity to stderr (`RUST_LOG` takes precedence).
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push the document to the tracker (and optionally pull back).
    Sync(SyncArgs),

    /// Preview how stories pair with existing tracker issues.
    Match(MatchArgs),

    /// Inspect and prune pre-sync backups.
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },

    /// Put the tracker back into the state captured by a backup.
    Restore(RestoreArgs),
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

// ---------------------------------------------------------------------------
// Exit status
// ---------------------------------------------------------------------------

/// Map an aborted command onto the exit-code contract.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<SyncError>() {
            return e.exit_code();
        }
        if cause.is::<ConfigError>() || cause.is::<FormatError>() {
            return ExitCode::Validation;
        }
        if let Some(e) = cause.downcast_ref::<RegistryError>() {
            return match e {
                RegistryError::UnknownTracker { .. } | RegistryError::MissingSetting { .. } => {
                    ExitCode::Validation
                }
                RegistryError::Io { .. } | RegistryError::Json { .. } => ExitCode::ApiFailure,
            };
        }
    }
    ExitCode::ApiFailure
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome: Result<ExitCode> = match cli.command {
        Commands::Sync(args) => args.run(),
        Commands::Match(args) => args.run(),
        Commands::Backup { command } => commands::backup::run(command),
        Commands::Restore(args) => args.run(),
    };

    let code = match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            exit_code_for(&err)
        }
    };
    std::process::exit(code.code());
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use epicsync_core::error::TrackerError;

    #[test]
    fn wrapped_errors_keep_their_exit_code() {
        let err = Err::<(), _>(SyncError::Validation("no stories".into()))
            .context("sync failed")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), ExitCode::Validation);

        let err = Err::<(), _>(SyncError::Connectivity(TrackerError::Auth("expired".into())))
            .context("sync failed")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), ExitCode::ApiFailure);
    }

    #[test]
    fn config_and_registry_problems_are_validation_failures() {
        let err = anyhow::Error::new(ConfigError::Invalid("threshold".into()));
        assert_eq!(exit_code_for(&err), ExitCode::Validation);

        let err = anyhow::Error::new(RegistryError::UnknownTracker {
            tag: "jira".into(),
            known: "file, memory".into(),
        });
        assert_eq!(exit_code_for(&err), ExitCode::Validation);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
