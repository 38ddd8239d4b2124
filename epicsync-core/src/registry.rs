//! Tracker registry: maps a tracker-type tag to an adapter constructor.
//!
//! # Storage layout (file adapter)
//!
//! ```text
//! ~/.epicsync/
//!   trackers/
//!     <project>.json   (whole tracker store, rewritten atomically)
//! ```
//!
//! Selection is a plain compile-time table; callers may register further
//! factories before building.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{data_root_at, TrackerConfig};
use crate::error::RegistryError;
use crate::file_tracker::FileTracker;
use crate::memory::MemoryTracker;
use crate::tracker::Tracker;

/// Constructor for one tracker family. `home` resolves default store paths.
pub type TrackerFactory = fn(&TrackerConfig, &Path) -> Result<Box<dyn Tracker>, RegistryError>;

/// Tag → constructor map.
#[derive(Clone, Default)]
pub struct TrackerRegistry {
    factories: BTreeMap<String, TrackerFactory>,
}

impl TrackerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with the adapters shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", build_memory);
        registry.register("file", build_file);
        registry
    }

    /// Register (or replace) the factory for `tag`.
    pub fn register(&mut self, tag: impl Into<String>, factory: TrackerFactory) {
        self.factories.insert(tag.into(), factory);
    }

    pub fn tags(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Build the adapter named by `config.kind`.
    pub fn build_at(
        &self,
        config: &TrackerConfig,
        home: &Path,
    ) -> Result<Box<dyn Tracker>, RegistryError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| RegistryError::UnknownTracker {
                tag: config.kind.clone(),
                known: self.tags().join(", "),
            })?;
        factory(config, home)
    }
}

/// `<home>/.epicsync/trackers/<project>.json`: pure, no I/O.
pub fn tracker_store_path_at(home: &Path, project: &str) -> PathBuf {
    data_root_at(home)
        .join("trackers")
        .join(format!("{project}.json"))
}

fn build_memory(config: &TrackerConfig, _home: &Path) -> Result<Box<dyn Tracker>, RegistryError> {
    Ok(Box::new(MemoryTracker::new(config.project.clone())))
}

fn build_file(config: &TrackerConfig, home: &Path) -> Result<Box<dyn Tracker>, RegistryError> {
    if config.project.trim().is_empty() {
        return Err(RegistryError::MissingSetting {
            tag: config.kind.clone(),
            setting: "project",
        });
    }
    let path = config
        .path
        .clone()
        .unwrap_or_else(|| tracker_store_path_at(home, &config.project));
    Ok(Box::new(FileTracker::open(path, &config.project)?))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(kind: &str) -> TrackerConfig {
        TrackerConfig {
            kind: kind.to_string(),
            project: "PROJ".to_string(),
            path: None,
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = TrackerRegistry::with_builtins();
        assert_eq!(registry.tags(), vec!["file", "memory"]);
    }

    #[test]
    fn unknown_tag_lists_known_tags() {
        let home = TempDir::new().unwrap();
        let err = TrackerRegistry::with_builtins()
            .build_at(&config("jira"), home.path())
            .err()
            .expect("unknown tracker");
        let msg = err.to_string();
        assert!(msg.contains("jira"));
        assert!(msg.contains("file, memory"));
    }

    #[test]
    fn store_path_is_correct() {
        let home = TempDir::new().unwrap();
        let path = tracker_store_path_at(home.path(), "PROJ");
        assert!(path.ends_with(".epicsync/trackers/PROJ.json"));
    }

    #[test]
    fn custom_factory_can_replace_builtin() {
        fn named(config: &TrackerConfig, _home: &Path) -> Result<Box<dyn Tracker>, RegistryError> {
            Ok(Box::new(
                MemoryTracker::new(config.project.clone()).with_name("custom"),
            ))
        }
        let home = TempDir::new().unwrap();
        let mut registry = TrackerRegistry::with_builtins();
        registry.register("memory", named);
        let tracker = registry.build_at(&config("memory"), home.path()).expect("build");
        assert_eq!(tracker.name(), "custom");
    }

    #[test]
    fn file_tracker_requires_project() {
        let home = TempDir::new().unwrap();
        let mut cfg = config("file");
        cfg.project = " ".into();
        let err = TrackerRegistry::with_builtins()
            .build_at(&cfg, home.path())
            .err()
            .expect("missing project");
        assert!(matches!(err, RegistryError::MissingSetting { .. }));
    }
}
