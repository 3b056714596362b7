use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;

use crate::addon::AddonFactory;
use crate::collect::{PhasedTask, TaskCollector};
use crate::config::Config;
use crate::core::{CancelToken, Hook, Phase, RunContext, Stage};
use crate::error::{HaoriError, TaskGenerationError};
use crate::executor::Executor;
use crate::plan::Plan;
use crate::registry::AddonRegistry;
use crate::report::{RunReport, TaskError};
use crate::resolve::{TaskGraph, resolve};
use crate::store::{FileStore, FingerprintStore};
use crate::utils::as_overhead;

/// Builder for [`Manager`], collects addons before any of them is
/// constructed.
pub struct ManagerBuilder {
    config: Config,
    root: Utf8PathBuf,
    factories: Vec<AddonFactory>,
    store: Option<Box<dyn FingerprintStore>>,
}

impl ManagerBuilder {
    /// Project root, defaults to the current directory.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn addon(mut self, factory: AddonFactory) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn addons(mut self, factories: impl IntoIterator<Item = AddonFactory>) -> Self {
        self.factories.extend(factories);
        self
    }

    /// Replaces the default store, a [`FileStore`] at `state_file`.
    pub fn store(mut self, store: impl FingerprintStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Validates the config, constructs the addons and opens the store.
    pub fn finish(self) -> Result<Manager, HaoriError> {
        let start = Instant::now();
        self.config.validate()?;

        let registry = AddonRegistry::load(self.factories, &self.config)?;

        let store = match self.store {
            Some(store) => store,
            None => Box::new(FileStore::open(self.root.join(&self.config.state_file))?),
        };

        tracing::info!(
            "Loaded {} addons {}",
            registry.len(),
            as_overhead(start)
        );

        Ok(Manager {
            settings: Arc::new(self.config.addons.clone()),
            config: self.config,
            root: self.root,
            registry,
            store,
            cancel: CancelToken::new(),
        })
    }
}

/// Entry point: runs hooks against a set of addons.
///
/// ```rust,no_run
/// use haori::{AddonDef, AddonFactory, Config, Hook, Manager, Phase, TaskDescriptor};
///
/// # fn main() -> Result<(), haori::HaoriError> {
/// let readme = AddonDef::new("readme").on(Phase::main(Hook::Build), |ctx, tasks| {
///     tasks.add(
///         TaskDescriptor::new("copy")
///             .file_dep("README.md")
///             .target(ctx.output("README.md"))
///             .run(|ctx| {
///                 let target = ctx.resolve(&ctx.run.output("README.md"));
///                 std::fs::create_dir_all(target.parent().unwrap())?;
///                 std::fs::copy(ctx.resolve(&"README.md".into()), target)?;
///                 Ok(())
///             }),
///     );
///     Ok(())
/// });
///
/// let manager = Manager::builder(Config::default())
///     .addon(AddonFactory::of(readme))
///     .finish()?;
///
/// let report = manager.run("build")?;
/// std::process::exit(report.exit_code());
/// # }
/// ```
pub struct Manager {
    config: Config,
    root: Utf8PathBuf,
    registry: AddonRegistry,
    store: Box<dyn FingerprintStore>,
    settings: Arc<BTreeMap<String, toml::Table>>,
    cancel: CancelToken,
}

impl Manager {
    pub fn builder(config: Config) -> ManagerBuilder {
        ManagerBuilder {
            config,
            root: Utf8PathBuf::from("."),
            factories: Vec::new(),
            store: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn registry(&self) -> &AddonRegistry {
        &self.registry
    }

    /// Token stopping the current and every later run once cancelled.
    /// Call [`CancelToken::reset`] to run again.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs every phase of `hook`.
    ///
    /// Configuration, integrity and cycle errors are returned before a single
    /// task is executed. Task failures don't make this function fail, they
    /// are recorded in the returned report.
    pub fn run(&self, hook: &str) -> Result<RunReport, HaoriError> {
        let start = Instant::now();
        let hook: Hook = hook.parse()?;

        tracing::info!(
            "Running {} in {} mode.",
            style("haori").red(),
            style(hook).blue()
        );

        let ctx = self.context(hook);
        let (tasks, generation) = self.collect(&ctx)?;
        let graph = resolve(tasks)?;

        tracing::info!("Resolved {} tasks {}", graph.len(), as_overhead(start));

        let mut report = Executor::new(&*self.store, self.config.signature)
            .workers(self.config.workers)
            .cancel_token(self.cancel.clone())
            .execute(&graph, &ctx)?;

        report.errors.extend(generation.into_iter().map(|error| TaskError {
            task: error.addon,
            phase: error.phase,
            message: format!("{:#}", error.source),
        }));
        report.settle(self.cancel.is_cancelled());

        tracing::info!("Finished {hook} {}", as_overhead(start));
        Ok(report)
    }

    /// The task graph `hook` would run, without checking any fingerprint.
    pub fn graph(&self, hook: &str) -> Result<TaskGraph, HaoriError> {
        let ctx = self.context(hook.parse()?);
        let (tasks, _) = self.collect(&ctx)?;
        Ok(resolve(tasks)?)
    }

    /// Reports which tasks of `hook` would run and why, running nothing.
    pub fn plan(&self, hook: &str) -> Result<Plan, HaoriError> {
        let ctx = self.context(hook.parse()?);
        let (tasks, _) = self.collect(&ctx)?;
        let graph = resolve(tasks)?;

        Ok(Plan::compute(&graph, &ctx, &*self.store, self.config.signature))
    }

    /// Drops the stored fingerprints of `tasks`, so they run next time.
    /// Returns the number of records removed.
    pub fn forget<I, S>(&self, tasks: I) -> Result<usize, HaoriError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;

        for task in tasks {
            if self.store.remove(task.as_ref())? {
                tracing::debug!(task = task.as_ref(), "forgot fingerprint");
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn context(&self, hook: Hook) -> RunContext {
        RunContext::new(hook, self.root.clone(), &self.config, self.settings.clone())
    }

    /// Collects the tasks of all three phases of a hook.
    fn collect(
        &self,
        ctx: &RunContext,
    ) -> Result<(Vec<PhasedTask>, Vec<TaskGenerationError>), TaskGenerationError> {
        let collector = TaskCollector::new(&self.registry);
        let mut tasks = Vec::new();
        let mut errors = Vec::new();

        for stage in Stage::ALL {
            let collection = collector.collect(Phase::new(stage, ctx.hook), ctx)?;
            tasks.extend(collection.tasks);
            errors.extend(collection.errors);
        }

        Ok((tasks, errors))
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use serde::Deserialize;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    use super::*;
    use crate::addon::{Addon, AddonDef, AddonSettings, Tasks};
    use crate::core::Stage;
    use crate::error::{ConfigurationError, IntegrityError};
    use crate::fingerprint::Staleness;
    use crate::report::{RunStatus, TaskState};
    use crate::task::{ResourceId, TaskDescriptor};

    /// Copies every `*.txt` file of the root into `files/` of the output.
    fn contents() -> AddonFactory {
        AddonFactory::of(AddonDef::new("contents").on(Phase::main(Hook::Build), |ctx, tasks| {
            for source in ctx.glob("*.txt")? {
                let target = ctx.output(Utf8Path::new("files").join(source.as_path()));
                let (from, to) = (source.clone(), target.clone());

                tasks.add(
                    TaskDescriptor::new(format!("copy:/files/{source}"))
                        .file_dep(source)
                        .target(target)
                        .run(move |ctx| {
                            let to = ctx.resolve(&to);
                            fs::create_dir_all(to.parent().unwrap())?;
                            fs::copy(ctx.resolve(&from), to)?;
                            Ok(())
                        }),
                );
            }
            Ok(())
        }))
    }

    #[derive(Default, Deserialize)]
    struct HashSettings {
        #[serde(default)]
        file: Option<String>,
    }

    /// Writes SHA256 sums of the copied files.
    struct Sums {
        file: String,
        runs: Arc<AtomicUsize>,
    }

    impl Addon for Sums {
        fn name(&self) -> &str {
            "hash"
        }

        fn capabilities(&self) -> std::collections::BTreeSet<Phase> {
            [Phase::post(Hook::Build)].into()
        }

        fn tasks(&self, phase: Phase, ctx: &RunContext, tasks: &mut Tasks) -> anyhow::Result<()> {
            if phase.stage != Stage::Post {
                bail!("unexpected phase {phase}");
            }

            let inputs: Vec<ResourceId> = ctx
                .glob("*.txt")?
                .iter()
                .map(|id| ctx.output(Utf8Path::new("files").join(id.as_path())))
                .collect();

            let sums = ctx.output(&self.file);
            let runs = self.runs.clone();
            let output_dir = ctx.output_dir.clone();

            tasks.add(
                TaskDescriptor::new("sha256sums")
                    .file_deps(inputs.clone())
                    .target(sums.clone())
                    .run(move |ctx| {
                        runs.fetch_add(1, Ordering::SeqCst);

                        let mut text = String::new();
                        for input in &inputs {
                            let digest = Sha256::digest(fs::read(ctx.resolve(input))?);
                            let name = input.as_path().strip_prefix(&output_dir)?;
                            writeln!(text, "{digest:x}  {name}")?;
                        }

                        fs::write(ctx.resolve(&sums), text)?;
                        Ok(())
                    }),
            );
            Ok(())
        }
    }

    fn hash(runs: Arc<AtomicUsize>) -> AddonFactory {
        AddonFactory::new("hash", move |settings: &AddonSettings| {
            let settings: HashSettings = settings.parse()?;
            Ok(Box::new(Sums {
                file: settings.file.unwrap_or_else(|| "SHA256SUMS".into()),
                runs,
            }) as Box<dyn Addon>)
        })
    }

    struct Project {
        dir: TempDir,
        runs: Arc<AtomicUsize>,
    }

    impl Project {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::write(dir.path().join("a.txt"), "alpha").unwrap();
            fs::write(dir.path().join("b.txt"), "beta").unwrap();
            Self {
                dir,
                runs: Arc::default(),
            }
        }

        fn root(&self) -> Utf8PathBuf {
            Utf8PathBuf::try_from(self.dir.path().to_path_buf()).unwrap()
        }

        fn manager(&self) -> Manager {
            let config = Config::from_toml("output_dir = \"out\"").unwrap();
            Manager::builder(config)
                .root(self.root())
                .addon(contents())
                .addon(hash(self.runs.clone()))
                .finish()
                .unwrap()
        }

        fn read(&self, path: &str) -> String {
            fs::read_to_string(self.root().join(path)).unwrap()
        }
    }

    fn sha256(text: &str) -> String {
        format!("{:x}", Sha256::digest(text.as_bytes()))
    }

    #[test]
    fn test_end_to_end() {
        let project = Project::new();

        // first run builds everything
        let report = project.manager().run("build").unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.state("contents:copy:/files/a.txt"), Some(TaskState::Succeeded));
        assert_eq!(report.state("hash:sha256sums"), Some(TaskState::Succeeded));
        assert_eq!(project.read("out/files/a.txt"), "alpha");

        let sums = project.read("out/SHA256SUMS");
        assert!(sums.contains(&format!("{}  files/a.txt", sha256("alpha"))));
        assert!(sums.contains(&format!("{}  files/b.txt", sha256("beta"))));

        // second run, a fresh manager reading the state file, does nothing
        let report = project.manager().run("build").unwrap();
        assert_eq!(report.count(TaskState::Skipped), 3);
        assert!(report.executed().is_empty());
        assert_eq!(project.read("out/SHA256SUMS"), sums);
        assert_eq!(project.runs.load(Ordering::SeqCst), 1);

        // third run after an edit reruns the edited chain only
        fs::write(project.root().join("a.txt"), "gamma").unwrap();
        let report = project.manager().run("build").unwrap();
        assert_eq!(
            report.executed(),
            vec!["contents:copy:/files/a.txt", "hash:sha256sums"]
        );
        assert_eq!(report.state("contents:copy:/files/b.txt"), Some(TaskState::Skipped));
        assert_eq!(project.read("out/files/a.txt"), "gamma");
        assert!(project.read("out/SHA256SUMS").contains(&sha256("gamma")));
        assert_eq!(project.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_post_phase_waits_for_main() {
        let project = Project::new();
        let graph = project.manager().graph("build").unwrap();

        let upstream = graph.upstream("hash:sha256sums");
        assert_eq!(
            upstream,
            vec!["contents:copy:/files/a.txt", "contents:copy:/files/b.txt"]
        );
    }

    #[test]
    fn test_plan_and_forget() {
        let project = Project::new();
        let manager = project.manager();

        let plan = manager.plan("build").unwrap();
        assert_eq!(plan.stale().count(), 3);

        manager.run("build").unwrap();
        assert!(manager.plan("build").unwrap().is_up_to_date());

        fs::write(project.root().join("b.txt"), "delta").unwrap();
        let plan = manager.plan("build").unwrap();
        assert!(matches!(
            plan.get("contents:copy:/files/b.txt").unwrap().staleness,
            Staleness::Changed(_)
        ));
        assert_eq!(
            plan.get("hash:sha256sums").unwrap().staleness,
            Staleness::Upstream("contents:copy:/files/b.txt".into())
        );
        assert!(plan.get("contents:copy:/files/a.txt").unwrap().staleness.is_up_to_date());
        manager.run("build").unwrap();

        assert_eq!(manager.forget(["contents:copy:/files/a.txt", "nope"]).unwrap(), 1);
        let report = manager.run("build").unwrap();
        assert_eq!(report.executed(), vec!["contents:copy:/files/a.txt"]);
    }

    #[test]
    fn test_shared_target_runs_nothing() {
        let project = Project::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let clash = {
            let ran = ran.clone();
            AddonDef::new("clash").on(Phase::main(Hook::Build), move |ctx, tasks| {
                let ran = ran.clone();
                tasks.add(
                    TaskDescriptor::new("x")
                        .target(ctx.output("files/a.txt"))
                        .run(move |_| {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                );
                Ok(())
            })
        };

        let manager = Manager::builder(Config::from_toml("output_dir = \"out\"").unwrap())
            .root(project.root())
            .addon(contents())
            .addon(AddonFactory::of(clash))
            .finish()
            .unwrap();

        let err = manager.run("build").unwrap_err();
        match err {
            HaoriError::Integrity(IntegrityError::SharedTargets(conflicts)) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(
                    conflicts[0].tasks,
                    vec!["contents:copy:/files/a.txt", "clash:x"]
                );
            }
            other => panic!("unexpected error {other}"),
        }

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!project.root().join("out").exists());
    }

    #[test]
    fn test_generation_error_fails_run() {
        let project = Project::new();
        let flaky = AddonDef::new("flaky").on(Phase::pre(Hook::Build), |_, _| bail!("offline"));

        let manager = Manager::builder(Config::default())
            .root(project.root())
            .store(crate::store::MemoryStore::new())
            .addon(AddonFactory::of(flaky))
            .addon(contents())
            .finish()
            .unwrap();

        let report = manager.run("build").unwrap();
        assert_eq!(report.status, RunStatus::Failure);
        assert_eq!(report.count(TaskState::Succeeded), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].task, "flaky");
        assert!(report.errors[0].message.contains("offline"));
    }

    #[test]
    fn test_unknown_hook() {
        let project = Project::new();
        let err = project.manager().run("deploy").unwrap_err();
        assert!(matches!(
            err,
            HaoriError::Configuration(ConfigurationError::UnknownHook(hook)) if hook == "deploy"
        ));
    }

    #[test]
    fn test_hook_without_tasks() {
        let project = Project::new();
        let report = project.manager().run("check").unwrap();
        assert!(report.is_success());
        assert!(report.states.is_empty());
    }

    #[test]
    fn test_cancelled_before_run() {
        let project = Project::new();
        let manager = project.manager();
        manager.cancel_token().cancel();

        let report = manager.run("build").unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.exit_code(), 130);
        assert!(report.states.values().all(|&s| s == TaskState::Pending));

        manager.cancel_token().reset();
        assert!(manager.run("build").unwrap().is_success());
    }

    #[test]
    fn test_addon_settings_reach_addon() {
        let project = Project::new();
        let config = Config::from_toml(
            r#"
            output_dir = "out"

            [addons.hash]
            file = "sums.txt"
            "#,
        )
        .unwrap();

        let manager = Manager::builder(config)
            .root(project.root())
            .addon(contents())
            .addon(hash(Arc::default()))
            .finish()
            .unwrap();

        assert!(manager.run("build").unwrap().is_success());
        assert!(project.root().join("out/sums.txt").exists());
    }
}
