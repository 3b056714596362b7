use std::fmt::{Display, Formatter};

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Phase;
use crate::task::ResourceId;

#[derive(Debug, Error)]
pub enum HaoriError {
    #[error("Configuration error:\n{0}")]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Generation(#[from] TaskGenerationError),

    #[error("Conflicting task graph:\n{0}")]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Fingerprint store:\n{0}")]
    Store(#[from] StoreError),

    #[error("Failed to build the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Couldn't read config file '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse config file '{path}'.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: toml::de::Error,
    },

    #[error("Option 'workers' must be at least 1")]
    InvalidWorkers,

    #[error("Unknown hook '{0}'")]
    UnknownHook(String),

    #[error("Invalid phase '{0}'")]
    InvalidPhase(String),

    #[error("Addon names must not be empty")]
    EmptyAddonName,

    #[error("Addon '{0}' is registered more than once")]
    DuplicateAddon(String),

    #[error("Addon '{name}' couldn't be constructed.\n{source}")]
    Addon { name: String, source: anyhow::Error },
}

/// An addon failed while enumerating its tasks for a phase.
#[derive(Debug, Error)]
#[error("Addon '{addon}' failed to generate tasks for '{phase}':\n{source}")]
pub struct TaskGenerationError {
    pub addon: String,
    pub phase: Phase,
    pub source: anyhow::Error,
}

/// Two or more tasks claim the same target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConflict {
    pub target: ResourceId,
    pub tasks: Vec<String>,
}

impl Display for TargetConflict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' is a target of {}", self.target, quoted(&self.tasks))
    }
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Duplicate task names: {}", quoted(.0))]
    DuplicateTasks(Vec<String>),

    #[error("Shared targets:\n{}", lines(.0))]
    SharedTargets(Vec<TargetConflict>),
}

#[derive(Debug, Error)]
#[error("Dependency cycle: {}", .cycle.join(" -> "))]
pub struct CycleError {
    /// Task names along the cycle, the first one repeated at the end.
    pub cycle: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode fingerprints.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't replace the state file.\n{0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Fingerprint store lock is poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Path '{0}' is outside of the project root")]
    OutsideRoot(String),
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("'{name}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn lines(conflicts: &[TargetConflict]) -> String {
    conflicts
        .iter()
        .map(|conflict| format!("  {conflict}"))
        .collect::<Vec<_>>()
        .join("\n")
}
