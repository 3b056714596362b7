use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::anyhow;
use camino::Utf8Path;

use crate::addon::Tasks;
use crate::core::{ArcStr, Phase, RunContext};
use crate::error::TaskGenerationError;
use crate::registry::AddonRegistry;
use crate::task::TaskDescriptor;
use crate::utils::panic_message;

/// A task descriptor together with the phase and addon it came from.
#[derive(Debug, Clone)]
pub struct PhasedTask {
    pub phase: Phase,
    pub addon: ArcStr,
    pub task: TaskDescriptor,
}

impl PhasedTask {
    pub fn name(&self) -> &str {
        &self.task.name
    }
}

/// Tasks gathered for one phase, along with the addons that failed to
/// produce theirs.
#[derive(Debug, Default)]
pub struct Collection {
    pub tasks: Vec<PhasedTask>,
    pub errors: Vec<TaskGenerationError>,
}

pub struct TaskCollector<'a> {
    registry: &'a AddonRegistry,
}

impl<'a> TaskCollector<'a> {
    pub fn new(registry: &'a AddonRegistry) -> Self {
        Self { registry }
    }

    /// Asks every addon implementing `phase` for its tasks.
    ///
    /// A failing addon keeps the tasks it produced before failing. In strict
    /// mode the first failure is returned instead.
    pub fn collect(&self, phase: Phase, ctx: &RunContext) -> Result<Collection, TaskGenerationError> {
        let mut collection = Collection::default();

        for item in self.registry.implementing(phase) {
            let mut tasks = Tasks::new();

            let result = catch_unwind(AssertUnwindSafe(|| item.addon.tasks(phase, ctx, &mut tasks)))
                .unwrap_or_else(|panic| Err(anyhow!(panic_message(panic.as_ref()))));

            let produced = tasks.into_vec();
            tracing::debug!(addon = &*item.name, %phase, count = produced.len(), "collected tasks");

            collection
                .tasks
                .extend(produced.into_iter().map(|task| PhasedTask {
                    phase,
                    addon: item.name.clone(),
                    task: anchor(qualify(&item.name, task), &ctx.root),
                }));

            if let Err(source) = result {
                let error = TaskGenerationError {
                    addon: item.name.to_string(),
                    phase,
                    source,
                };

                if ctx.strict {
                    return Err(error);
                }

                tracing::warn!("{error:#}");
                collection.errors.push(error);
            }
        }

        Ok(collection)
    }
}

/// Prefixes the task name with the name of its addon.
fn qualify(addon: &str, mut task: TaskDescriptor) -> TaskDescriptor {
    task.name = if task.name.is_empty() {
        addon.to_string()
    } else {
        format!("{addon}:{}", task.name)
    };
    task
}

/// Rewrites absolute ids inside the project root as relative ones, so every
/// resource has a single id.
fn anchor(mut task: TaskDescriptor, root: &Utf8Path) -> TaskDescriptor {
    task.file_deps = std::mem::take(&mut task.file_deps)
        .into_iter()
        .map(|id| id.relative_to(root))
        .collect();
    task.targets = std::mem::take(&mut task.targets)
        .into_iter()
        .map(|id| id.relative_to(root))
        .collect();
    task
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::bail;

    use super::*;
    use crate::Config;
    use crate::addon::{AddonDef, AddonFactory};
    use crate::core::Hook;
    use crate::task::ResourceId;

    fn context(strict: bool) -> RunContext {
        let config = Config {
            strict,
            ..Config::default()
        };
        RunContext::new(Hook::Build, ".".into(), &config, Arc::default())
    }

    fn registry() -> AddonRegistry {
        let flaky = AddonDef::new("flaky").on(Phase::main(Hook::Build), |_, tasks| {
            tasks.add(TaskDescriptor::new("first"));
            bail!("lost connection")
        });

        let contents = AddonDef::new("contents")
            .on(Phase::main(Hook::Build), |_, tasks| {
                tasks.add(TaskDescriptor::new("copy:/files/a.txt"));
                tasks.add(TaskDescriptor::new(""));
                Ok(())
            })
            .on(Phase::post(Hook::Build), |_, tasks| {
                tasks.add(TaskDescriptor::new("index"));
                Ok(())
            });

        AddonRegistry::load(
            [AddonFactory::of(flaky), AddonFactory::of(contents)],
            &Config::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_names_are_prefixed() {
        let registry = registry();
        let collection = TaskCollector::new(&registry)
            .collect(Phase::post(Hook::Build), &context(false))
            .unwrap();

        assert_eq!(collection.tasks.len(), 1);
        assert_eq!(collection.tasks[0].name(), "contents:index");
        assert_eq!(collection.tasks[0].phase, Phase::post(Hook::Build));
    }

    #[test]
    fn test_partial_tasks_kept_on_error() {
        let registry = registry();
        let collection = TaskCollector::new(&registry)
            .collect(Phase::main(Hook::Build), &context(false))
            .unwrap();

        let names: Vec<_> = collection.tasks.iter().map(PhasedTask::name).collect();
        assert_eq!(names, vec!["flaky:first", "contents:copy:/files/a.txt", "contents"]);
        assert_eq!(collection.errors.len(), 1);
        assert_eq!(collection.errors[0].addon, "flaky");
    }

    #[test]
    fn test_strict_aborts() {
        let registry = registry();
        let err = TaskCollector::new(&registry)
            .collect(Phase::main(Hook::Build), &context(true))
            .unwrap_err();

        assert_eq!(err.addon, "flaky");
        assert_eq!(err.phase, Phase::main(Hook::Build));
    }

    #[test]
    fn test_absolute_ids_become_relative() {
        let mut registry = AddonRegistry::new();
        registry
            .register(Box::new(AddonDef::new("abs").on(
                Phase::main(Hook::Build),
                |ctx, tasks| {
                    tasks.add(
                        TaskDescriptor::new("t")
                            .file_dep(ctx.root.join("a.txt"))
                            .target(ctx.root.join("./out/a.txt")),
                    );
                    Ok(())
                },
            )))
            .unwrap();

        let config = Config::default();
        let ctx = RunContext::new(Hook::Build, "/srv/site".into(), &config, Arc::default());
        let collection = TaskCollector::new(&registry)
            .collect(Phase::main(Hook::Build), &ctx)
            .unwrap();

        let task = &collection.tasks[0].task;
        assert_eq!(task.dependencies().collect::<Vec<_>>(), vec![&ResourceId::from("a.txt")]);
        assert_eq!(task.outputs().collect::<Vec<_>>(), vec![&ResourceId::from("out/a.txt")]);
    }

    #[test]
    fn test_panicking_addon_is_reported() {
        let mut registry = AddonRegistry::new();
        registry
            .register(Box::new(AddonDef::new("boom").on(
                Phase::pre(Hook::Build),
                |_, _| panic!("bad state"),
            )))
            .unwrap();

        let collection = TaskCollector::new(&registry)
            .collect(Phase::pre(Hook::Build), &context(false))
            .unwrap();

        assert!(collection.tasks.is_empty());
        assert!(collection.errors[0].source.to_string().contains("bad state"));
    }
}
