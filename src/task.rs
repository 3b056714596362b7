//! Task descriptors contributed by addons.
//!
//! A [`TaskDescriptor`] is a plain description of a unit of work: the
//! resources it reads, the resources it produces, and the ordered actions that
//! produce them. Descriptors are re-created by their addon on every run and
//! carry no state of their own; whether a task is up to date is decided from
//! its fingerprint alone.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{ArcStr, RunContext};

/// Any addressable artifact: a source file, an output file, or a cache entry
/// derived from a URL. Relative ids are resolved against the project root.
///
/// Ids are kept normalized, `./out/a.txt` and `out/a.txt/` are both
/// `out/a.txt`. An id naming a directory covers everything inside of it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Utf8PathBuf);

impl ResourceId {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        let path: Utf8PathBuf = path.into();
        Self(
            path.components()
                .filter(|component| *component != Utf8Component::CurDir)
                .collect(),
        )
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    /// Makes an absolute id inside `root` relative to it, other ids are
    /// returned as they are.
    pub fn relative_to(self, root: &Utf8Path) -> Self {
        if !self.0.is_absolute() {
            return self;
        }

        match self.0.strip_prefix(root) {
            Ok(relative) => Self::new(relative),
            Err(_) => self,
        }
    }

    /// Whether this id is `other`, or a directory containing it.
    pub fn contains(&self, other: &ResourceId) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl Borrow<Utf8Path> for ResourceId {
    fn borrow(&self) -> &Utf8Path {
        &self.0
    }
}

impl Debug for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceId({})", self.0)
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Utf8PathBuf> for ResourceId {
    fn from(value: Utf8PathBuf) -> Self {
        Self::new(value)
    }
}

impl From<&Utf8Path> for ResourceId {
    fn from(value: &Utf8Path) -> Self {
        Self::new(value)
    }
}

/// The context passed to every action.
pub struct ActionContext<'a> {
    /// The run this action belongs to.
    pub run: &'a RunContext,
    /// Fully qualified name of the task, `addon:task`.
    pub task: &'a str,
    /// Tracing span assigned to the task.
    pub(crate) span: tracing::Span,
}

impl ActionContext<'_> {
    /// Resolves a resource id to a path on disk.
    pub fn resolve(&self, id: &ResourceId) -> Utf8PathBuf {
        self.run.resolve(id)
    }

    /// Updates the progress message shown for this task.
    pub fn set_message(&self, message: impl Into<String>) {
        self.span.pb_set_message(&message.into());
    }
}

type ActionFn = Arc<dyn Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
enum ActionKind {
    Call(ActionFn),
    Command { program: String, args: Vec<String> },
}

/// A single step of a task.
#[derive(Clone)]
pub struct Action {
    label: ArcStr,
    kind: ActionKind,
}

impl Action {
    /// An in-process action.
    pub fn call<F>(label: impl Into<ArcStr>, func: F) -> Self
    where
        F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            kind: ActionKind::Call(Arc::new(func)),
        }
    }

    /// An external program, run in the project root. A non-zero exit status
    /// fails the action.
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let label = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            label: label.into(),
            kind: ActionKind::Command { program, args },
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn run(&self, ctx: &ActionContext) -> anyhow::Result<()> {
        match &self.kind {
            ActionKind::Call(func) => func(ctx),
            ActionKind::Command { program, args } => {
                let output = Command::new(program)
                    .args(args)
                    .current_dir(&ctx.run.root)
                    .output()
                    .with_context(|| format!("couldn't spawn '{program}'"))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    bail!("'{}' exited with {}\n{}", self.label, output.status, stderr.trim());
                }

                Ok(())
            }
        }
    }
}

impl Debug for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Action({})", self.label)
    }
}

/// Description of one unit of work.
///
/// ```rust
/// use haori::{Action, TaskDescriptor};
///
/// let task = TaskDescriptor::new("copy:/files/a.txt")
///     .file_dep("files/a.txt")
///     .target("_output/files/a.txt")
///     .action(Action::call("copy", |ctx| {
///         let _ = ctx.task;
///         Ok(())
///     }));
///
/// assert_eq!(task.name(), "copy:/files/a.txt");
/// ```
#[derive(Clone, Debug, Default)]
pub struct TaskDescriptor {
    pub(crate) name: String,
    pub(crate) file_deps: BTreeSet<ResourceId>,
    pub(crate) targets: BTreeSet<ResourceId>,
    pub(crate) actions: Vec<Action>,
    pub(crate) signature: Option<String>,
    pub(crate) doc: Option<String>,
    pub(crate) always_run: bool,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn file_dep(mut self, id: impl Into<ResourceId>) -> Self {
        self.file_deps.insert(id.into());
        self
    }

    pub fn file_deps<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ResourceId>,
    {
        self.file_deps.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn target(mut self, id: impl Into<ResourceId>) -> Self {
        self.targets.insert(id.into());
        self
    }

    pub fn targets<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ResourceId>,
    {
        self.targets.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Shorthand for an in-process action labelled after the task.
    pub fn run<F>(self, func: F) -> Self
    where
        F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let label = format!("{}#{}", self.name, self.actions.len());
        self.action(Action::call(label, func))
    }

    /// Extra signature for conditions that are not files, such as a
    /// configuration value. A change of the signature makes the task stale.
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Extra signature computed from any serializable value.
    pub fn signature_of<T: Serialize + ?Sized>(self, value: &T) -> serde_json::Result<Self> {
        let json = serde_json::to_string(value)?;
        Ok(self.signature(json))
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Never consider this task up to date.
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &ResourceId> {
        self.file_deps.iter()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ResourceId> {
        self.targets.iter()
    }

    pub fn get_doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_builder_collects_sets() {
        let task = TaskDescriptor::new("t")
            .file_dep("b.txt")
            .file_deps(["a.txt", "b.txt"])
            .targets(["out/a.txt"])
            .target("out/a.txt");

        let deps: Vec<_> = task.dependencies().map(ToString::to_string).collect();
        assert_eq!(deps, vec!["a.txt", "b.txt"]);
        assert_eq!(task.outputs().count(), 1);
    }

    #[test]
    fn test_signature_of_is_stable() {
        let mut config = BTreeMap::new();
        config.insert("theme", "dark");
        config.insert("lang", "en");

        let a = TaskDescriptor::new("a").signature_of(&config).unwrap();
        let b = TaskDescriptor::new("b").signature_of(&config).unwrap();
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.signature.as_deref(), Some(r#"{"lang":"en","theme":"dark"}"#));
    }

    #[test]
    fn test_run_labels_actions() {
        let task = TaskDescriptor::new("t").run(|_| Ok(())).run(|_| Ok(()));
        let labels: Vec<_> = task.actions.iter().map(Action::label).collect();
        assert_eq!(labels, vec!["t#0", "t#1"]);
    }

    #[test]
    fn test_ids_are_normalized() {
        assert_eq!(ResourceId::from("./out/a.txt"), ResourceId::from("out/a.txt"));
        assert_eq!(ResourceId::from("out/docs/"), ResourceId::from("out/docs"));
        assert_eq!(ResourceId::from("out/./a.txt").to_string(), "out/a.txt");
    }

    #[test]
    fn test_relative_to_root() {
        let root = Utf8Path::new("/srv/site");
        assert_eq!(
            ResourceId::from("/srv/site/out/a.txt").relative_to(root),
            ResourceId::from("out/a.txt")
        );
        assert_eq!(
            ResourceId::from("/etc/hosts").relative_to(root),
            ResourceId::from("/etc/hosts")
        );
        assert_eq!(ResourceId::from("a.txt").relative_to(root), ResourceId::from("a.txt"));
    }

    #[test]
    fn test_directory_contains() {
        let out = ResourceId::from("out");
        assert!(out.contains(&"out/files/a.txt".into()));
        assert!(out.contains(&"out".into()));
        assert!(!out.contains(&"output/a.txt".into()));
    }

    #[test]
    fn test_command_label() {
        let action = Action::command("tar", ["-xf", "bundle.tgz"]);
        assert_eq!(action.label(), "tar -xf bundle.tgz");
    }
}
