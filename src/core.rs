use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ConfigurationError, ContextError};
use crate::task::ResourceId;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `haori` this is the content signature of every dependency resource, and
/// the building block of directory signatures.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// A named lifecycle stage, mapped from the user facing sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hook {
    Status,
    Init,
    Build,
    Check,
    Serve,
    Archive,
    Publish,
}

impl Hook {
    pub const ALL: [Hook; 7] = [
        Hook::Status,
        Hook::Init,
        Hook::Build,
        Hook::Check,
        Hook::Serve,
        Hook::Archive,
        Hook::Publish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Hook::Status => "status",
            Hook::Init => "init",
            Hook::Build => "build",
            Hook::Check => "check",
            Hook::Serve => "serve",
            Hook::Archive => "archive",
            Hook::Publish => "publish",
        }
    }
}

impl Display for Hook {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hook {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hook::ALL
            .into_iter()
            .find(|hook| hook.as_str() == s)
            .ok_or_else(|| ConfigurationError::UnknownHook(s.to_string()))
    }
}

/// The sub-stage of a hook. Every hook runs its `pre_` tasks, then its bare
/// tasks, then its `post_` tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Pre,
    Main,
    Post,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Pre, Stage::Main, Stage::Post];

    pub fn prefix(self) -> &'static str {
        match self {
            Stage::Pre => "pre_",
            Stage::Main => "",
            Stage::Post => "post_",
        }
    }
}

/// A phase is a hook together with one of its stages, e.g. `post_build`.
///
/// Addons declare the phases they implement and are dispatched on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Phase {
    pub stage: Stage,
    pub hook: Hook,
}

impl Phase {
    pub fn new(stage: Stage, hook: Hook) -> Self {
        Self { stage, hook }
    }

    pub fn pre(hook: Hook) -> Self {
        Self::new(Stage::Pre, hook)
    }

    pub fn main(hook: Hook) -> Self {
        Self::new(Stage::Main, hook)
    }

    pub fn post(hook: Hook) -> Self {
        Self::new(Stage::Post, hook)
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.stage.prefix(), self.hook)
    }
}

impl FromStr for Phase {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stage, rest) = if let Some(rest) = s.strip_prefix("pre_") {
            (Stage::Pre, rest)
        } else if let Some(rest) = s.strip_prefix("post_") {
            (Stage::Post, rest)
        } else {
            (Stage::Main, s)
        };

        let hook = rest
            .parse()
            .map_err(|_| ConfigurationError::InvalidPhase(s.to_string()))?;

        Ok(Phase::new(stage, hook))
    }
}

/// Immutable state shared by every addon and every action during one run.
///
/// A fresh context is created for each [`Manager::run`](crate::Manager::run)
/// invocation and is never mutated afterwards.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The hook being run.
    pub hook: Hook,
    /// Project root, all relative resource ids are resolved against it.
    pub root: Utf8PathBuf,
    /// Directory of the assembled artifact tree, relative to `root`.
    pub output_dir: Utf8PathBuf,
    /// Abort on the first failure.
    pub strict: bool,
    /// Treat every fingerprint as stale.
    pub force: bool,
    pub(crate) settings: Arc<BTreeMap<String, toml::Table>>,
}

impl RunContext {
    pub(crate) fn new(
        hook: Hook,
        root: Utf8PathBuf,
        config: &crate::Config,
        settings: Arc<BTreeMap<String, toml::Table>>,
    ) -> Self {
        Self {
            hook,
            root,
            output_dir: config.output_dir.clone(),
            strict: config.strict,
            force: config.force,
            settings,
        }
    }

    /// Resolves a resource id to a path on disk.
    pub fn resolve(&self, id: &ResourceId) -> Utf8PathBuf {
        self.root.join(id.as_path())
    }

    /// A resource id for a path inside the output directory.
    pub fn output(&self, path: impl AsRef<Utf8Path>) -> ResourceId {
        ResourceId::new(self.output_dir.join(path.as_ref()))
    }

    /// Settings table of an addon, as found under `[addons.<name>]`.
    pub fn settings(&self, addon: &str) -> Option<&toml::Table> {
        self.settings.get(addon)
    }

    /// Expands a glob pattern relative to the project root into resource ids,
    /// sorted for determinism.
    ///
    /// ```rust,no_run
    /// # fn demo(ctx: &haori::RunContext) -> Result<(), haori::ContextError> {
    /// let notebooks = ctx.glob("files/**/*.ipynb")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn glob(&self, pattern: &str) -> Result<Vec<ResourceId>, ContextError> {
        let pattern_full = self.root.join(pattern);
        let mut found = Vec::new();

        for entry in glob::glob(pattern_full.as_str())? {
            let path = Utf8PathBuf::try_from(entry?)?;
            let relative = path
                .strip_prefix(&self.root)
                .map_err(|_| ContextError::OutsideRoot(path.to_string()))?;
            found.push(ResourceId::new(relative));
        }

        found.sort();
        Ok(found)
    }
}

/// Signals the executor to stop starting new tasks.
///
/// Cloning the token shares the underlying flag, so it can be handed to a
/// signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag so the owner can run again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::pre(Hook::Build).to_string(), "pre_build");
        assert_eq!(Phase::main(Hook::Check).to_string(), "check");
        assert_eq!(Phase::post(Hook::Archive).to_string(), "post_archive");
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!("post_build".parse::<Phase>().unwrap(), Phase::post(Hook::Build));
        assert_eq!("status".parse::<Phase>().unwrap(), Phase::main(Hook::Status));
        assert_eq!("pre_init".parse::<Phase>().unwrap(), Phase::pre(Hook::Init));
        assert!("post_deploy".parse::<Phase>().is_err());
        assert!("pre_".parse::<Phase>().is_err());
    }

    #[test]
    fn test_unknown_hook() {
        let err = "deploy".parse::<Hook>().unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownHook(name) if name == "deploy"));
    }

    #[test]
    fn test_phase_order() {
        // stages sort before hooks, so phases of one hook line up pre < main < post
        let mut phases = vec![
            Phase::post(Hook::Build),
            Phase::main(Hook::Build),
            Phase::pre(Hook::Build),
        ];
        phases.sort();
        assert_eq!(
            phases,
            vec![
                Phase::pre(Hook::Build),
                Phase::main(Hook::Build),
                Phase::post(Hook::Build)
            ]
        );
    }

    #[test]
    fn test_hash_file_hex() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hello").unwrap();

        let hash = Hash32::hash_file(&path).unwrap();
        assert_eq!(hash.to_hex(), blake3::hash(b"hello").to_hex().as_str());

        std::fs::write(&path, "hello!").unwrap();
        assert_ne!(hash, Hash32::hash_file(&path).unwrap());
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }
}
