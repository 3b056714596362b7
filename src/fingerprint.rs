//! Task fingerprints.
//!
//! A fingerprint captures everything that decides whether a task has to run
//! again: a signature of every dependency, the existence of every target, and
//! the optional extra signature supplied by the addon. It is always computed
//! from the current state of the disk and compared with the fingerprint stored
//! after the last successful run.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Hash32, RunContext};
use crate::task::{ResourceId, TaskDescriptor};

/// How dependency resources are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMode {
    /// BLAKE3 hash of the contents.
    #[default]
    Content,
    /// Modification time and length, cheaper but touched files rerun.
    Mtime,
}

/// Signature of a single dependency resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signature {
    Hash(String),
    Modified { secs: u64, nanos: u32, len: u64 },
    Missing,
}

impl Signature {
    fn of(path: &Utf8Path, mode: SignatureMode) -> std::io::Result<Self> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Signature::Missing),
            Err(e) => return Err(e),
        };

        if meta.is_dir() {
            return Ok(Signature::Hash(sign_dir(path, mode)?.to_hex()));
        }

        match mode {
            SignatureMode::Content => Ok(Signature::Hash(Hash32::hash_file(path)?.to_hex())),
            SignatureMode::Mtime => {
                let modified = meta.modified()?.duration_since(UNIX_EPOCH).unwrap_or_default();
                Ok(Signature::Modified {
                    secs: modified.as_secs(),
                    nanos: modified.subsec_nanos(),
                    len: meta.len(),
                })
            }
        }
    }
}

/// Directories are signed over their files, in sorted order, so that adding,
/// removing or renaming a file changes the signature.
fn sign_dir(dir: &Utf8Path, mode: SignatureMode) -> std::io::Result<Hash32> {
    let mut files = Vec::new();
    walk(dir, &mut files)?;
    files.sort();

    let mut hasher = blake3::Hasher::new();
    for file in files {
        let relative = file.strip_prefix(dir).unwrap_or(&file);
        hasher.update(relative.as_str().as_bytes());
        hasher.update(&[0]);

        match Signature::of(&file, mode)? {
            Signature::Hash(hash) => hasher.update(hash.as_bytes()),
            Signature::Modified { secs, nanos, len } => hasher
                .update(&secs.to_le_bytes())
                .update(&nanos.to_le_bytes())
                .update(&len.to_le_bytes()),
            Signature::Missing => hasher.update(b"missing"),
        };
    }

    Ok(hasher.finalize().into())
}

fn walk(dir: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            walk(entry.path(), files)?;
        } else {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(())
}

/// The signature of a task's dependency and target state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    pub dependencies: BTreeMap<ResourceId, Signature>,
    pub targets: BTreeMap<ResourceId, bool>,
    pub extra: Option<String>,
}

impl Fingerprint {
    /// Computes the fingerprint of a task from the live state of the disk.
    pub fn compute(
        task: &TaskDescriptor,
        ctx: &RunContext,
        mode: SignatureMode,
    ) -> std::io::Result<Self> {
        let mut dependencies = BTreeMap::new();
        for id in &task.file_deps {
            dependencies.insert(id.clone(), Signature::of(&ctx.resolve(id), mode)?);
        }

        let targets = task
            .targets
            .iter()
            .map(|id| (id.clone(), ctx.resolve(id).exists()))
            .collect();

        Ok(Self {
            dependencies,
            targets,
            extra: task.signature.clone(),
        })
    }

    pub fn targets_exist(&self) -> bool {
        self.targets.values().all(|exists| *exists)
    }

    pub fn missing_dependency(&self) -> Option<&ResourceId> {
        self.dependencies
            .iter()
            .find(|(_, signature)| **signature == Signature::Missing)
            .map(|(id, _)| id)
    }

    /// Compares the current fingerprint with the one recorded after the last
    /// successful run.
    pub fn compare(&self, previous: Option<&Fingerprint>) -> Staleness {
        if let Some(id) = self.missing_dependency() {
            return Staleness::MissingDependency(id.clone());
        }

        let Some(previous) = previous else {
            return Staleness::NeverRun;
        };

        if let Some((id, _)) = self.targets.iter().find(|(_, exists)| !**exists) {
            return Staleness::MissingTarget(id.clone());
        }

        if !self.dependencies.keys().eq(previous.dependencies.keys()) {
            return Staleness::DependenciesChanged;
        }

        for (id, signature) in &self.dependencies {
            if previous.dependencies.get(id) != Some(signature) {
                return Staleness::Changed(id.clone());
            }
        }

        if self.extra != previous.extra {
            return Staleness::SignatureChanged;
        }

        if self.targets != previous.targets {
            return Staleness::TargetsChanged;
        }

        Staleness::UpToDate
    }
}

/// Why a task has to run, or that it doesn't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    UpToDate,
    Forced,
    AlwaysRun,
    NeverRun,
    MissingDependency(ResourceId),
    MissingTarget(ResourceId),
    DependenciesChanged,
    Changed(ResourceId),
    SignatureChanged,
    TargetsChanged,
    /// An upstream task is stale, so this one will be re-checked after it.
    Upstream(String),
    /// The fingerprint couldn't be computed or loaded.
    Unreadable(String),
}

impl Staleness {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Staleness::UpToDate)
    }
}

impl Display for Staleness {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Staleness::UpToDate => write!(f, "up to date"),
            Staleness::Forced => write!(f, "forced"),
            Staleness::AlwaysRun => write!(f, "always runs"),
            Staleness::NeverRun => write!(f, "never ran"),
            Staleness::MissingDependency(id) => write!(f, "dependency '{id}' does not exist"),
            Staleness::MissingTarget(id) => write!(f, "target '{id}' is missing"),
            Staleness::DependenciesChanged => write!(f, "set of dependencies changed"),
            Staleness::Changed(id) => write!(f, "'{id}' changed"),
            Staleness::SignatureChanged => write!(f, "signature changed"),
            Staleness::TargetsChanged => write!(f, "set of targets changed"),
            Staleness::Upstream(task) => write!(f, "upstream task '{task}' is stale"),
            Staleness::Unreadable(reason) => write!(f, "couldn't check: {reason}"),
        }
    }
}
