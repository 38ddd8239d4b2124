//! epicsync core library: document model, tracker port, collaborators.
//!
//! Public API surface:
//! - [`types`]: the parsed epic / story / subtask / comment tree
//! - [`issue`]: tracker-side issue model and write payloads
//! - [`tracker`]: the [`Tracker`] port and its capability set
//! - [`registry`]: tag → adapter constructor map
//! - [`memory`], [`file_tracker`]: reference adapters
//! - [`document`]: parser and writeback ports (YAML implementations)
//! - [`config`]: `config.yaml` loading and validation
//! - [`error`]: error enums

pub mod config;
pub mod document;
pub mod error;
pub mod file_tracker;
pub mod issue;
pub mod memory;
pub mod registry;
pub mod tracker;
pub mod types;

pub use config::{ConflictStrategy, Phase, SimilarityKind, SyncConfig};
pub use document::{DocumentParser, Writeback, YamlParser, YamlWriteback};
pub use error::{ConfigError, FormatError, RegistryError, TrackerError, WritebackError};
pub use issue::{CreatedIssue, FieldUpdate, IssueFields, NewIssue, TrackerComment, TrackerIssue};
pub use memory::MemoryTracker;
pub use registry::TrackerRegistry;
pub use tracker::{Capabilities, Tracker};
pub use types::{Comment, Description, Epic, IssueKey, Priority, Status, Story, StoryId, Subtask};
