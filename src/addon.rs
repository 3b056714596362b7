//! The addon interface.
//!
//! Addons are the pluggable units that contribute tasks to a hook. Each addon
//! declares the phases it implements up front; the collector only ever asks an
//! addon for the tasks of a phase from that set.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::bail;
use serde::de::DeserializeOwned;

use crate::core::{Phase, RunContext};
use crate::task::TaskDescriptor;

/// Sink for the task descriptors an addon produces for one phase.
///
/// Descriptors added before an addon returns an error are kept.
#[derive(Debug, Default)]
pub struct Tasks {
    items: Vec<TaskDescriptor>,
}

impl Tasks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: TaskDescriptor) -> &mut Self {
        self.items.push(task);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn into_vec(self) -> Vec<TaskDescriptor> {
        self.items
    }
}

impl Extend<TaskDescriptor> for Tasks {
    fn extend<T: IntoIterator<Item = TaskDescriptor>>(&mut self, iter: T) {
        self.items.extend(iter);
    }
}

/// A pluggable unit contributing tasks at specific lifecycle phases.
pub trait Addon: Send + Sync {
    /// Unique name, used as the prefix of every task name of this addon.
    fn name(&self) -> &str;

    /// Phases this addon implements.
    fn capabilities(&self) -> BTreeSet<Phase>;

    /// Produces the task descriptors for one of the phases in
    /// [`capabilities`](Addon::capabilities). Called once per run and phase.
    fn tasks(&self, phase: Phase, ctx: &RunContext, tasks: &mut Tasks) -> anyhow::Result<()>;
}

type PhaseFn = Box<dyn Fn(&RunContext, &mut Tasks) -> anyhow::Result<()> + Send + Sync>;

/// An addon defined by a table of phase callbacks.
///
/// ```rust
/// use haori::{AddonDef, Hook, Phase, TaskDescriptor};
///
/// let addon = AddonDef::new("contents").on(Phase::main(Hook::Build), |ctx, tasks| {
///     for file in ctx.glob("files/**/*")? {
///         let target = ctx.output(file.as_path());
///         tasks.add(
///             TaskDescriptor::new(format!("copy:/{file}"))
///                 .file_dep(file)
///                 .target(target),
///         );
///     }
///     Ok(())
/// });
/// ```
pub struct AddonDef {
    name: String,
    phases: BTreeMap<Phase, PhaseFn>,
}

impl AddonDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: BTreeMap::new(),
        }
    }

    /// Registers the callback for a phase, replacing an earlier one.
    pub fn on<F>(mut self, phase: Phase, callback: F) -> Self
    where
        F: Fn(&RunContext, &mut Tasks) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.phases.insert(phase, Box::new(callback));
        self
    }
}

impl Addon for AddonDef {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BTreeSet<Phase> {
        self.phases.keys().copied().collect()
    }

    fn tasks(&self, phase: Phase, ctx: &RunContext, tasks: &mut Tasks) -> anyhow::Result<()> {
        match self.phases.get(&phase) {
            Some(callback) => callback(ctx, tasks),
            None => bail!("addon '{}' does not implement '{}'", self.name, phase),
        }
    }
}

/// Settings of one addon, the `[addons.<name>]` table of the config.
#[derive(Debug, Clone, Copy)]
pub struct AddonSettings<'a> {
    name: &'a str,
    table: Option<&'a toml::Table>,
}

impl<'a> AddonSettings<'a> {
    pub(crate) fn new(name: &'a str, table: Option<&'a toml::Table>) -> Self {
        Self { name, table }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn table(&self) -> Option<&toml::Table> {
        self.table
    }

    /// Deserializes the settings, an absent table yields the default value.
    pub fn parse<T>(&self) -> anyhow::Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.table {
            Some(table) => Ok(toml::Value::Table(table.clone()).try_into()?),
            None => Ok(T::default()),
        }
    }
}

type BuildFn = Box<dyn FnOnce(&AddonSettings) -> anyhow::Result<Box<dyn Addon>>>;

/// Deferred construction of an addon, so that a failing addon can be
/// excluded without affecting the others.
pub struct AddonFactory {
    name: String,
    build: BuildFn,
}

impl AddonFactory {
    pub fn new<F>(name: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&AddonSettings) -> anyhow::Result<Box<dyn Addon>> + 'static,
    {
        Self {
            name: name.into(),
            build: Box::new(build),
        }
    }

    /// Wraps an addon which is already constructed.
    pub fn of<A: Addon + 'static>(addon: A) -> Self {
        let name = addon.name().to_string();
        Self::new(name, move |_| Ok(Box::new(addon) as Box<dyn Addon>))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn build(self, settings: &AddonSettings) -> anyhow::Result<Box<dyn Addon>> {
        (self.build)(settings)
    }
}
