//! Sync configuration.
//!
//! Loaded from `<home>/.epicsync/config.yaml`; a missing file yields the
//! defaults. Like the rest of the crate, every loader has an `_at(home)` form
//! for tests and a convenience form that resolves the home directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Policy enums
// ---------------------------------------------------------------------------

/// A sync phase. Phases always run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Descriptions,
    Subtasks,
    Comments,
    Statuses,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Descriptions,
            Phase::Subtasks,
            Phase::Comments,
            Phase::Statuses,
        ]
    }

    /// Sort and dedupe a caller-supplied phase list into execution order.
    pub fn ordered(requested: &[Phase]) -> Vec<Phase> {
        let mut phases = requested.to_vec();
        phases.sort();
        phases.dedup();
        phases
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Descriptions => write!(f, "descriptions"),
            Phase::Subtasks => write!(f, "subtasks"),
            Phase::Comments => write!(f, "comments"),
            Phase::Statuses => write!(f, "statuses"),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "descriptions" | "description" => Ok(Phase::Descriptions),
            "subtasks" | "subtask" => Ok(Phase::Subtasks),
            "comments" | "comment" => Ok(Phase::Comments),
            "statuses" | "status" => Ok(Phase::Statuses),
            other => Err(format!(
                "unknown phase '{other}'; expected: descriptions, subtasks, comments, statuses"
            )),
        }
    }
}

/// How a two-sided change is resolved in bidirectional sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    Local,
    Remote,
    Merge,
    #[default]
    Ask,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::Local => write!(f, "local"),
            ConflictStrategy::Remote => write!(f, "remote"),
            ConflictStrategy::Merge => write!(f, "merge"),
            ConflictStrategy::Ask => write!(f, "ask"),
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ConflictStrategy::Local),
            "remote" => Ok(ConflictStrategy::Remote),
            "merge" => Ok(ConflictStrategy::Merge),
            "ask" => Ok(ConflictStrategy::Ask),
            other => Err(format!(
                "unknown conflict strategy '{other}'; expected: local, remote, merge, ask"
            )),
        }
    }
}

/// Title similarity function used by fuzzy matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SimilarityKind {
    #[default]
    JaroWinkler,
    /// Longest-matching-blocks ratio.
    CharRatio,
}

impl fmt::Display for SimilarityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimilarityKind::JaroWinkler => write!(f, "jaro-winkler"),
            SimilarityKind::CharRatio => write!(f, "char-ratio"),
        }
    }
}

impl FromStr for SimilarityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "jaro-winkler" => Ok(SimilarityKind::JaroWinkler),
            "char-ratio" => Ok(SimilarityKind::CharRatio),
            other => Err(format!(
                "unknown similarity '{other}'; expected: jaro-winkler, char-ratio"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which adapter to build and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Registry tag, e.g. `file` or `memory`.
    pub kind: String,
    /// Project key prefix used for new issue keys.
    pub project: String,
    /// Store location for file-backed adapters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kind: "file".to_string(),
            project: "PROJ".to_string(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum fuzzy-title score for a pairing to be accepted.
    pub threshold: f64,
    pub similarity: SimilarityKind,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            similarity: SimilarityKind::default(),
        }
    }
}

/// Token-bucket parameters: at most `capacity` calls per `refill_period_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_period_ms: u64,
}

impl RateLimitConfig {
    /// Published (or conservative) request budgets per tracker family.
    pub fn for_tracker(tag: &str) -> Self {
        let (capacity, refill_period_ms) = match tag {
            "jira" => (100, 60_000),
            "github" => (30, 60_000),
            "linear" => (25, 60_000),
            "gitlab" => (60, 60_000),
            _ => (1_000, 1_000),
        };
        Self {
            capacity,
            refill_period_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added or subtracted at random.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker threads per phase; stories are the unit of parallelism.
    pub parallelism: usize,
    /// All-or-nothing batches instead of best-effort.
    pub transactional: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            transactional: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    /// Root directory for backups and sync state; defaults to `~/.epicsync`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Keep at most this many backups per epic after each run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep: Option<usize>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            keep: Some(20),
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub tracker: TrackerConfig,
    pub phases: Vec<Phase>,
    pub bidirectional: bool,
    pub conflict_strategy: ConflictStrategy,
    pub matching: MatchingConfig,
    /// Overrides the tracker-specific default when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: RetryConfig,
    pub execution: ExecutionConfig,
    pub backup: BackupConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            phases: Phase::all().to_vec(),
            bidirectional: false,
            conflict_strategy: ConflictStrategy::default(),
            matching: MatchingConfig::default(),
            rate_limit: None,
            retry: RetryConfig::default(),
            execution: ExecutionConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl SyncConfig {
    /// The configured limiter, or the tracker family default.
    pub fn effective_rate_limit(&self) -> RateLimitConfig {
        self.rate_limit
            .unwrap_or_else(|| RateLimitConfig::for_tracker(&self.tracker.kind))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.matching.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "matching.threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.phases.is_empty() {
            return Err(ConfigError::Invalid("at least one phase is required".into()));
        }
        let limit = self.effective_rate_limit();
        if limit.capacity == 0 || limit.refill_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.capacity and rate_limit.refill_period_ms must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.execution.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "execution.parallelism must be at least 1".into(),
            ));
        }
        if self.tracker.kind.trim().is_empty() {
            return Err(ConfigError::Invalid("tracker.kind must not be empty".into()));
        }
        Ok(())
    }

    /// Backup/state root: the configured directory or `<home>/.epicsync`.
    pub fn data_dir_at(&self, home: &Path) -> PathBuf {
        self.backup.dir.clone().unwrap_or_else(|| data_root_at(home))
    }
}

// ---------------------------------------------------------------------------
// Paths + load
// ---------------------------------------------------------------------------

/// `<home>/.epicsync`
pub fn data_root_at(home: &Path) -> PathBuf {
    home.join(".epicsync")
}

/// `<home>/.epicsync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    data_root_at(home).join("config.yaml")
}

/// Load and validate the config under `home`; defaults if the file is absent.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    load_from(&config_path_at(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

/// Load and validate the config at an explicit path.
pub fn load_from(path: &Path) -> Result<SyncConfig, ConfigError> {
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: SyncConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().unwrap();
        let config = load_at(home.path()).expect("load");
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.matching.threshold, 0.75);
        assert_eq!(config.matching.similarity, SimilarityKind::JaroWinkler);
        assert_eq!(config.phases.len(), 4);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().unwrap();
        let path = config_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "tracker:\n  kind: jira\nmatching:\n  threshold: 0.9\n  similarity: char-ratio\nconflict_strategy: merge\n",
        )
        .unwrap();

        let config = load_at(home.path()).expect("load");
        assert_eq!(config.tracker.kind, "jira");
        assert_eq!(config.tracker.project, "PROJ");
        assert_eq!(config.matching.threshold, 0.9);
        assert_eq!(config.matching.similarity, SimilarityKind::CharRatio);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Merge);
        assert_eq!(config.effective_rate_limit().capacity, 100);
    }

    #[test]
    fn out_of_range_threshold_is_invalid() {
        let mut config = SyncConfig::default();
        config.matching.threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_parallelism_is_invalid() {
        let mut config = SyncConfig::default();
        config.execution.parallelism = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_yaml_reports_path() {
        let home = TempDir::new().unwrap();
        let path = config_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "phases: [descriptions, nonsense]\n").unwrap();
        let err = load_at(home.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.yaml"));
    }

    #[test]
    fn phases_are_ordered_and_deduped() {
        let ordered = Phase::ordered(&[Phase::Statuses, Phase::Descriptions, Phase::Statuses]);
        assert_eq!(ordered, vec![Phase::Descriptions, Phase::Statuses]);
    }

    #[test]
    fn similarity_names_parse_both_spellings() {
        assert_eq!("Char_Ratio".parse::<SimilarityKind>(), Ok(SimilarityKind::CharRatio));
        assert_eq!(" jaro-winkler ".parse::<SimilarityKind>(), Ok(SimilarityKind::JaroWinkler));
        let err = "levenshtein".parse::<SimilarityKind>().unwrap_err();
        assert!(err.contains("expected: jaro-winkler, char-ratio"));
    }

    #[test]
    fn unknown_similarity_in_file_is_a_parse_error() {
        let home = TempDir::new().unwrap();
        let path = config_path_at(home.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "matching:\n  similarity: soundex\n").unwrap();
        assert!(matches!(load_at(home.path()), Err(ConfigError::Parse { .. })));
    }
}
