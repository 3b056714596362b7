use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Write};
use std::time::{Duration, Instant};

use console::style;

use crate::core::{Hook, Phase};
use crate::resolve::TaskGraph;

/// Lifecycle of a task within one run.
///
/// `Pending` is the initial state; `Skipped`, `Succeeded`, `Failed` and
/// `Blocked` are terminal. A task left `Pending` after a run was never
/// started because the run was halted or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Skipped,
    Succeeded,
    Failed,
    Blocked,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Skipped | TaskState::Succeeded | TaskState::Failed | TaskState::Blocked
        )
    }

    /// Skipped or succeeded.
    pub fn is_ok(self) -> bool {
        matches!(self, TaskState::Skipped | TaskState::Succeeded)
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Skipped => "skipped",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Blocked => "blocked",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
}

/// An entry for every task that did not end up skipped or succeeded, and for
/// every addon that failed to produce its tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub task: String,
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Outcome of one hook invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub hook: Hook,
    pub states: BTreeMap<String, TaskState>,
    pub phases: BTreeMap<String, Phase>,
    pub errors: Vec<TaskError>,
    /// Timings of the tasks that were started.
    pub timings: BTreeMap<String, TaskExecution>,
    pub status: RunStatus,
}

impl RunReport {
    pub(crate) fn new(hook: Hook) -> Self {
        Self {
            hook,
            states: BTreeMap::new(),
            phases: BTreeMap::new(),
            errors: Vec::new(),
            timings: BTreeMap::new(),
            status: RunStatus::Success,
        }
    }

    pub fn state(&self, task: &str) -> Option<TaskState> {
        self.states.get(task).copied()
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.states.values().filter(|&&s| s == state).count()
    }

    /// Tasks whose actions were executed, successfully or not.
    pub fn executed(&self) -> Vec<&str> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, TaskState::Succeeded | TaskState::Failed))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Process exit status matching the outcome.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Success => 0,
            RunStatus::Failure => 1,
            RunStatus::Cancelled => 130,
        }
    }

    pub(crate) fn settle(&mut self, cancelled: bool) {
        self.status = if cancelled {
            RunStatus::Cancelled
        } else if !self.errors.is_empty() || self.states.values().any(|state| !state.is_ok()) {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };
    }

    /// Renders the task graph as a Mermaid diagram, coloured by task state.
    ///
    /// * **Green**: Succeeded
    /// * **Blue**: Skipped
    /// * **Red**: Failed
    /// * **Orange**: Blocked
    /// * **Grey**: never started
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        let mut f = String::new();
        let lines = graph.to_string();

        let mut names = BTreeMap::new();
        for index in graph.graph.node_indices() {
            names.insert(index.index(), graph.graph[index].name());
        }

        f.push_str(&lines);

        for (index, name) in names {
            let state = self.state(name).unwrap_or(TaskState::Pending);
            let color = match state {
                TaskState::Succeeded => "#90EE90",
                TaskState::Skipped => "#ADD8E6",
                TaskState::Failed => "#FF6347",
                TaskState::Blocked => "#FFA500",
                TaskState::Pending | TaskState::Running => "#D3D3D3",
            };

            let _ = writeln!(f, "    style {index:?} fill:{color}");
        }

        f
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let status = match self.status {
            RunStatus::Success => style("success").green(),
            RunStatus::Failure => style("failure").red(),
            RunStatus::Cancelled => style("cancelled").yellow(),
        };

        writeln!(
            f,
            "{} {}: {} succeeded, {} skipped, {} failed, {} blocked",
            style(self.hook).blue(),
            status,
            self.count(TaskState::Succeeded),
            self.count(TaskState::Skipped),
            self.count(TaskState::Failed),
            self.count(TaskState::Blocked),
        )?;

        for error in &self.errors {
            writeln!(
                f,
                "  {} [{}] {}",
                style(&error.task).bold(),
                error.phase,
                error.message
            )?;
        }

        Ok(())
    }
}
