//! Dry runs: which tasks would execute, and why.

use std::fmt::{Display, Formatter};

use console::style;
use petgraph::Direction;
use petgraph::visit::EdgeRef;
use rayon::prelude::*;

use crate::core::{Phase, RunContext};
use crate::fingerprint::{Fingerprint, SignatureMode, Staleness};
use crate::resolve::{Link, TaskGraph};
use crate::store::FingerprintStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub task: String,
    pub phase: Phase,
    pub staleness: Staleness,
}

/// Staleness of every task in a graph, in topological order.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    /// Checks every task against the store without running anything.
    ///
    /// A task that is up to date on its own is still reported stale when a
    /// task producing one of its dependencies is stale.
    pub fn compute(
        graph: &TaskGraph,
        ctx: &RunContext,
        store: &dyn FingerprintStore,
        mode: SignatureMode,
    ) -> Self {
        let mut own: Vec<Staleness> = graph
            .order
            .par_iter()
            .map(|&index| {
                let task = &graph.graph[index];

                if ctx.force {
                    return Staleness::Forced;
                }

                if task.task.always_run {
                    return Staleness::AlwaysRun;
                }

                let current = match Fingerprint::compute(&task.task, ctx, mode) {
                    Ok(current) => current,
                    Err(e) => return Staleness::Unreadable(e.to_string()),
                };

                match store.get(task.name()) {
                    Ok(previous) => current.compare(previous.as_ref().map(|r| &r.fingerprint)),
                    Err(e) => Staleness::Unreadable(e.to_string()),
                }
            })
            .collect();

        let mut position = vec![0; graph.len()];
        for (i, &index) in graph.order.iter().enumerate() {
            position[index.index()] = i;
        }

        for i in 0..own.len() {
            if !own[i].is_up_to_date() {
                continue;
            }

            let index = graph.order[i];
            let stale_upstream = graph
                .graph
                .edges_directed(index, Direction::Incoming)
                .filter(|edge| matches!(edge.weight(), Link::Resources(_)))
                .map(|edge| edge.source())
                .find(|up| !own[position[up.index()]].is_up_to_date());

            if let Some(up) = stale_upstream {
                own[i] = Staleness::Upstream(graph.graph[up].name().to_string());
            }
        }

        let entries = graph
            .order
            .iter()
            .zip(own)
            .map(|(&index, staleness)| {
                let task = &graph.graph[index];
                PlanEntry {
                    task: task.name().to_string(),
                    phase: task.phase,
                    staleness,
                }
            })
            .collect();

        Self { entries }
    }

    pub fn get(&self, task: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|entry| entry.task == task)
    }

    /// Entries of the tasks that would run.
    pub fn stale(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.staleness.is_up_to_date())
    }

    pub fn is_up_to_date(&self) -> bool {
        self.stale().next().is_none()
    }
}

impl Display for Plan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            let mark = if entry.staleness.is_up_to_date() {
                style("-").dim()
            } else {
                style("+").green()
            };

            writeln!(
                f,
                "{mark} {} [{}] {}",
                style(&entry.task).bold(),
                entry.phase,
                entry.staleness
            )?;
        }

        Ok(())
    }
}
