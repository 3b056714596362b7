//! Incremental execution of a task graph.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use anyhow::{Context as _, bail};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::Dfs;
use rayon::ThreadPoolBuilder;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::collect::PhasedTask;
use crate::core::{CancelToken, RunContext};
use crate::error::HaoriError;
use crate::fingerprint::{Fingerprint, SignatureMode, Staleness};
use crate::report::{RunReport, TaskError, TaskExecution, TaskState};
use crate::resolve::TaskGraph;
use crate::store::{FingerprintStore, TaskRecord};
use crate::task::ActionContext;
use crate::utils::{get_style_main, get_style_task, panic_message};

enum Outcome {
    /// The run was halted before the task could start.
    Unstarted,
    Skipped,
    Succeeded(Fingerprint),
    Failed(String),
}

struct Completion {
    index: NodeIndex,
    outcome: Outcome,
    start: Instant,
    duration: Duration,
}

enum Message {
    /// A worker picked the task up and is about to check it.
    Started(NodeIndex),
    Finished(Completion),
}

/// Runs the tasks of a [`TaskGraph`] on a bounded worker pool.
///
/// Tasks start as soon as all of their upstream tasks reached a terminal
/// state. Workers decide whether a task is stale and run its actions; the
/// calling thread schedules tasks and is the only one writing to the
/// fingerprint store.
pub struct Executor<'a> {
    store: &'a dyn FingerprintStore,
    mode: SignatureMode,
    workers: Option<usize>,
    cancel: CancelToken,
}

impl<'a> Executor<'a> {
    pub fn new(store: &'a dyn FingerprintStore, mode: SignatureMode) -> Self {
        Self {
            store,
            mode,
            workers: None,
            cancel: CancelToken::new(),
        }
    }

    /// Number of worker threads, `None` uses one per CPU.
    pub fn workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// This function executes the task graph using a thread pool. It performs
    /// a parallel topological walk of the graph, where tasks are executed as
    /// soon as their dependencies are met.
    ///
    /// The algorithm works as follows:
    /// 1. A pool of worker threads is spawned, the scheduler stays on the
    ///    calling thread.
    /// 2. A channel is created for receiving completions back from workers.
    /// 3. The initial set of tasks (those with no upstream tasks) is spawned.
    /// 4. The scheduler waits for completions. A succeeded task gets its
    ///    fingerprint recorded, then the waiting counts of its downstream
    ///    tasks are decremented; a task whose count reaches zero is spawned.
    /// 5. A failed task blocks everything downstream of it. In strict mode it
    ///    also halts the run: nothing that hasn't started yet will start.
    /// 6. The loop ends when no task is in flight.
    pub fn execute(&self, graph: &TaskGraph, ctx: &RunContext) -> Result<RunReport, HaoriError> {
        let total = graph.len();
        let mut report = RunReport::new(ctx.hook);

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers.unwrap_or(0))
            .thread_name(|i| format!("haori-worker-{i}"))
            .build()?;

        let mut states = vec![TaskState::Pending; total];
        let mut messages: Vec<Option<String>> = vec![None; total];
        let mut waiting: Vec<usize> = graph
            .graph
            .node_indices()
            .map(|index| {
                graph
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count()
            })
            .collect();

        let halt = &AtomicBool::new(self.cancel.is_cancelled());
        let cancel = &self.cancel;
        let store = self.store;
        let mode = self.mode;

        let root_span = tracing::span!(Level::INFO, "running_tasks", hook = %ctx.hook);
        root_span.pb_set_length(total as u64);
        if let Ok(style) = get_style_main() {
            root_span.pb_set_style(&style);
        }
        root_span.pb_set_message(&format!("Running {}...", ctx.hook));
        let _enter = root_span.enter();

        let pb_style = &get_style_task().ok();

        pool.in_place_scope(|s| {
            let (sender, receiver) = channel::<Message>();

            // A helper closure to spawn a task
            let spawn_task = move |index: NodeIndex| {
                let task = &graph.graph[index];
                let sender = sender.clone();
                let pb_style = pb_style.clone();

                s.spawn(move |_| {
                    let start = Instant::now();

                    if halt.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        let _ = sender.send(Message::Finished(Completion {
                            index,
                            outcome: Outcome::Unstarted,
                            start,
                            duration: Duration::ZERO,
                        }));
                        return;
                    }

                    let _ = sender.send(Message::Started(index));

                    let span = tracing::span!(Level::INFO, "task", name = task.name());
                    if let Some(style) = &pb_style {
                        span.pb_set_style(style);
                    }
                    span.pb_set_message(&format!("Running {}", task.name()));
                    let _enter = span.enter();

                    let outcome = match catch_unwind(AssertUnwindSafe(|| {
                        run_task(task, ctx, store, mode, &span)
                    })) {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(e)) => Outcome::Failed(format!("{e:#}")),
                        Err(panic) => Outcome::Failed(panic_message(panic.as_ref())),
                    };

                    if matches!(outcome, Outcome::Failed(_)) && ctx.strict {
                        halt.store(true, Ordering::SeqCst);
                    }

                    // Send result back to the scheduler
                    let _ = sender.send(Message::Finished(Completion {
                        index,
                        outcome,
                        start,
                        duration: start.elapsed(),
                    }));
                });
            };

            let mut in_flight = 0usize;

            // Seed initial tasks
            if !halt.load(Ordering::SeqCst) {
                for &index in &graph.order {
                    if waiting[index.index()] == 0 {
                        spawn_task(index);
                        in_flight += 1;
                    }
                }
            }

            // Scheduler loop
            while in_flight > 0 {
                let done = match receiver.recv() {
                    Ok(Message::Started(index)) => {
                        states[index.index()] = TaskState::Running;
                        continue;
                    }
                    Ok(Message::Finished(done)) => done,
                    Err(_) => break,
                };
                in_flight -= 1;

                let i = done.index.index();
                let name = graph.graph[done.index].name();

                match done.outcome {
                    Outcome::Unstarted => {
                        states[i] = TaskState::Pending;
                        continue;
                    }
                    Outcome::Skipped => {
                        tracing::debug!(task = name, "up to date");
                        states[i] = TaskState::Skipped;
                    }
                    Outcome::Succeeded(fingerprint) => {
                        match self.store.put(name, TaskRecord::new(fingerprint)) {
                            Ok(()) => states[i] = TaskState::Succeeded,
                            Err(e) => {
                                self.distrust(name);
                                states[i] = TaskState::Failed;
                                messages[i] = Some(format!("couldn't record fingerprint: {e}"));
                            }
                        }
                    }
                    Outcome::Failed(message) => {
                        // the targets may be half written now
                        self.distrust(name);
                        states[i] = TaskState::Failed;
                        messages[i] = Some(message);
                    }
                }

                report.timings.insert(
                    name.to_string(),
                    TaskExecution {
                        start: done.start,
                        duration: done.duration,
                    },
                );
                root_span.pb_inc(1);

                if states[i] == TaskState::Failed {
                    if let Some(message) = &messages[i] {
                        tracing::error!(task = name, "{message}");
                    }

                    if ctx.strict {
                        halt.store(true, Ordering::SeqCst);
                    }

                    block_downstream(graph, done.index, &mut states, &mut messages);
                    continue;
                }

                // Unlock dependents
                for next in graph.graph.neighbors_directed(done.index, Direction::Outgoing) {
                    let j = next.index();
                    waiting[j] -= 1;

                    if waiting[j] == 0
                        && states[j] == TaskState::Pending
                        && !halt.load(Ordering::SeqCst)
                        && !cancel.is_cancelled()
                    {
                        spawn_task(next);
                        in_flight += 1;
                    }
                }
            }
        });

        let cancelled = self.cancel.is_cancelled();

        for &index in &graph.order {
            let task = &graph.graph[index];
            let i = index.index();
            let name = task.name().to_string();

            let message = match states[i] {
                TaskState::Failed | TaskState::Blocked => messages[i].take(),
                TaskState::Pending | TaskState::Running if cancelled => {
                    Some("not started, the run was cancelled".to_string())
                }
                TaskState::Pending | TaskState::Running => {
                    Some("not started, the run was halted after a failure".to_string())
                }
                TaskState::Skipped | TaskState::Succeeded => None,
            };

            if let Some(message) = message {
                report.errors.push(TaskError {
                    task: name.clone(),
                    phase: task.phase,
                    message,
                });
            }

            report.phases.insert(name.clone(), task.phase);
            report.states.insert(name, states[i]);
        }

        report.settle(cancelled);
        tracing::info!(
            hook = %ctx.hook,
            succeeded = report.count(TaskState::Succeeded),
            skipped = report.count(TaskState::Skipped),
            failed = report.count(TaskState::Failed),
            blocked = report.count(TaskState::Blocked),
            "run complete"
        );

        Ok(report)
    }
}

impl Executor<'_> {
    /// Drops the record of a task whose last attempt failed, so that it is
    /// never skipped on the strength of an older success.
    fn distrust(&self, task: &str) {
        if let Err(e) = self.store.remove(task) {
            tracing::warn!(task, "couldn't drop the fingerprint of a failed task: {e}");
        }
    }
}

/// Decides whether a task is stale and runs its actions if it is.
fn run_task(
    task: &PhasedTask,
    ctx: &RunContext,
    store: &dyn FingerprintStore,
    mode: SignatureMode,
    span: &tracing::Span,
) -> anyhow::Result<Outcome> {
    let name = task.name();

    let current = Fingerprint::compute(&task.task, ctx, mode)
        .with_context(|| format!("couldn't fingerprint '{name}'"))?;

    if let Some(id) = current.missing_dependency() {
        bail!("dependency '{id}' does not exist");
    }

    let staleness = if ctx.force {
        Staleness::Forced
    } else if task.task.always_run {
        Staleness::AlwaysRun
    } else {
        let previous = store.get(name)?;
        current.compare(previous.as_ref().map(|record| &record.fingerprint))
    };

    if staleness.is_up_to_date() {
        return Ok(Outcome::Skipped);
    }

    tracing::debug!(task = name, reason = %staleness, "running");

    let actx = ActionContext {
        run: ctx,
        task: name,
        span: span.clone(),
    };

    for action in &task.task.actions {
        span.pb_set_message(&format!("{name}: {}", action.label()));
        action
            .run(&actx)
            .with_context(|| format!("action '{}' failed", action.label()))?;
    }

    // actions are expected to have created or modified the targets
    let fresh = Fingerprint::compute(&task.task, ctx, mode)
        .with_context(|| format!("couldn't fingerprint '{name}'"))?;

    if !fresh.targets_exist() {
        tracing::warn!(task = name, "not every target was produced");
    }

    Ok(Outcome::Succeeded(fresh))
}

/// Marks every pending task downstream of `failed` as blocked.
fn block_downstream(
    graph: &TaskGraph,
    failed: NodeIndex,
    states: &mut [TaskState],
    messages: &mut [Option<String>],
) {
    let name = graph.graph[failed].name();
    let mut dfs = Dfs::new(&graph.graph, failed);

    while let Some(index) = dfs.next(&graph.graph) {
        let i = index.index();
        if index == failed || states[i] != TaskState::Pending {
            continue;
        }

        states[i] = TaskState::Blocked;
        messages[i] = Some(format!("blocked by failed task '{name}'"));
    }
}
