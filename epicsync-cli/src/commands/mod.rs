//! Subcommands and the wiring they share.

pub mod backup;
pub mod matching;
pub mod restore;
pub mod sync;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use epicsync_core::config::{self, SyncConfig};
use epicsync_core::{DocumentParser, Epic, Tracker, TrackerRegistry, YamlParser};
use epicsync_sync::BackupStore;

/// Config file and tracker selection, accepted by every command that talks
/// to a tracker. Flags override `config.yaml`.
#[derive(Args, Debug, Clone, Default)]
pub struct TrackerArgs {
    /// Config file to use instead of `~/.epicsync/config.yaml`.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Tracker adapter tag (`file`, `memory`).
    #[arg(long, value_name = "TAG")]
    pub tracker: Option<String>,

    /// Project key prefix for new issues.
    #[arg(long)]
    pub project: Option<String>,

    /// Store location for the `file` tracker.
    #[arg(long, value_name = "PATH")]
    pub tracker_path: Option<PathBuf>,
}

impl TrackerArgs {
    /// Load the config and apply tracker overrides.
    pub fn load_config(&self, home: &Path) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => config::load_from(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => config::load_at(home).context("failed to load config")?,
        };
        if let Some(kind) = &self.tracker {
            config.tracker.kind = kind.clone();
        }
        if let Some(project) = &self.project {
            config.tracker.project = project.clone();
        }
        if let Some(path) = &self.tracker_path {
            config.tracker.path = Some(path.clone());
        }
        Ok(config)
    }
}

/// Everything a command needs once flags and config are resolved.
pub struct Session {
    pub home: PathBuf,
    pub config: SyncConfig,
    pub tracker: Box<dyn Tracker>,
}

impl Session {
    pub fn open(args: &TrackerArgs) -> Result<Self> {
        let home = home_dir()?;
        let config = args.load_config(&home)?;
        Self::with_config(home, config)
    }

    pub fn with_config(home: PathBuf, config: SyncConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let tracker = TrackerRegistry::with_builtins()
            .build_at(&config.tracker, &home)
            .with_context(|| format!("failed to open '{}' tracker", config.tracker.kind))?;
        tracing::debug!(tracker = tracker.name(), project = %config.tracker.project, "tracker ready");
        Ok(Self {
            home,
            config,
            tracker,
        })
    }

    /// Root for backups and sync state.
    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir_at(&self.home)
    }

    pub fn backups(&self) -> BackupStore {
        BackupStore::new(self.data_dir())
    }
}

pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Read and parse a YAML epic document.
pub fn read_document(path: &Path) -> Result<Epic> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let epic = YamlParser
        .parse(&source)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(epic)
}

/// Backup storage for commands that only read local files.
pub fn backup_store(config_path: Option<&Path>) -> Result<BackupStore> {
    let home = home_dir()?;
    let config = match config_path {
        Some(path) => config::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => config::load_at(&home).context("failed to load config")?,
    };
    Ok(BackupStore::new(config.data_dir_at(&home)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn flags_override_config_file() {
        let home = TempDir::new().unwrap();
        let dir = home.path().join(".epicsync");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.yaml"),
            "tracker:\n  kind: memory\n  project: FILE\n",
        )
        .unwrap();

        let args = TrackerArgs {
            project: Some("FLAG".into()),
            ..TrackerArgs::default()
        };
        let config = args.load_config(home.path()).unwrap();

        assert_eq!(config.tracker.kind, "memory");
        assert_eq!(config.tracker.project, "FLAG");
    }

    #[test]
    fn unknown_tracker_is_rejected() {
        let home = TempDir::new().unwrap();
        let mut config = SyncConfig::default();
        config.tracker.kind = "jira".into();

        let err = Session::with_config(home.path().to_path_buf(), config)
            .err()
            .expect("unknown tag");
        assert!(format!("{err:#}").contains("unknown tracker type 'jira'"));
    }
}
