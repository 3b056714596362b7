//! Dependency resolution.
//!
//! All tasks of a hook, from all three stages, are merged into one directed
//! acyclic graph. An edge `A → B` means `B` can only start once `A` reached a
//! terminal state. Edges come from two sources:
//!
//! * **Resources**: `A` declares a target which `B` declares as a dependency,
//!   or one of them is a directory containing the other.
//! * **Stages**: every task of a stage precedes every task of the next
//!   non-empty stage, so `post_build` tasks only ever see a finished `build`.
//!
//! Nothing is executed here, the graph is only validated: task names must be
//! unique, no two targets may be equal or nested, and there must be no cycles.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Bound;
use std::fmt::{Display, Formatter};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use camino::Utf8Path;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::collect::PhasedTask;
use crate::core::Stage;
use crate::error::{CycleError, HaoriError, IntegrityError, TargetConflict};
use crate::task::ResourceId;

/// Why one task has to wait for another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// The upstream task produces resources the downstream task reads.
    Resources(Vec<ResourceId>),
    /// The upstream task belongs to an earlier stage.
    Stage,
}

/// A validated task graph for one hook invocation.
#[derive(Debug)]
pub struct TaskGraph {
    pub(crate) graph: DiGraph<PhasedTask, Link>,
    /// Topological order, stable for identical input.
    pub(crate) order: Vec<NodeIndex>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Tasks in topological order.
    pub fn tasks(&self) -> impl Iterator<Item = &PhasedTask> {
        self.order.iter().map(|&index| &self.graph[index])
    }

    pub fn get(&self, name: &str) -> Option<&PhasedTask> {
        self.index_of(name).map(|index| &self.graph[index])
    }

    /// Names of the tasks `name` directly waits for.
    pub fn upstream(&self, name: &str) -> Vec<&str> {
        let Some(index) = self.index_of(name) else {
            return Vec::new();
        };

        let mut names: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|up| self.graph[up].name())
            .collect();

        names.sort_unstable();
        names
    }

    fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index].name() == name)
    }
}

/// Renders the graph as a Mermaid diagram.
impl Display for TaskGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for &index in &self.order {
            let task = &self.graph[index];
            let name = task.name().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, task.phase)?;
        }

        for edge in self.graph.edge_indices() {
            let Some((source, target)) = self.graph.edge_endpoints(edge) else {
                continue;
            };

            match &self.graph[edge] {
                Link::Stage => {
                    writeln!(f, "    {:?} -.-> {:?}", source.index(), target.index())?;
                }
                Link::Resources(ids) => {
                    let label = ids
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                        .replace('"', "\\\"");
                    writeln!(
                        f,
                        "    {:?} -- \"{}\" --> {:?}",
                        source.index(),
                        label,
                        target.index()
                    )?;
                }
            }
        }

        Ok(())
    }
}

/// Builds and validates the graph of a hook from the tasks of all stages.
pub fn resolve(tasks: Vec<PhasedTask>) -> Result<TaskGraph, HaoriError> {
    check_names(&tasks)?;
    check_targets(&tasks)?;

    let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
    let mut owners = BTreeMap::new();

    for task in tasks {
        let targets: Vec<_> = task.task.targets.iter().cloned().collect();
        let index = graph.add_node(task);
        for target in targets {
            owners.insert(target, index);
        }
    }

    let mut links: BTreeMap<(NodeIndex, NodeIndex), Link> = BTreeMap::new();

    for index in graph.node_indices() {
        for dep in &graph[index].task.file_deps {
            for owner in producers(&owners, dep) {
                if owner == index {
                    let name = graph[index].name().to_string();
                    return Err(CycleError {
                        cycle: vec![name.clone(), name],
                    }
                    .into());
                }

                match links
                    .entry((owner, index))
                    .or_insert_with(|| Link::Resources(Vec::new()))
                {
                    Link::Resources(ids) => ids.push(dep.clone()),
                    Link::Stage => unreachable!("stage links are added afterwards"),
                }
            }
        }
    }

    // every task of a stage precedes every task of the next non-empty stage
    let stages: Vec<Vec<NodeIndex>> = Stage::ALL
        .iter()
        .map(|&stage| {
            graph
                .node_indices()
                .filter(|&index| graph[index].phase.stage == stage)
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect();

    for pair in stages.windows(2) {
        for &before in &pair[0] {
            for &after in &pair[1] {
                links.entry((before, after)).or_insert(Link::Stage);
            }
        }
    }

    for ((source, target), link) in links {
        graph.add_edge(source, target, link);
    }

    let order = match toposort(&graph, None) {
        Ok(order) => order,
        Err(cycle) => return Err(find_cycle(&graph, cycle.node_id()).into()),
    };

    Ok(TaskGraph { graph, order })
}

fn check_names(tasks: &[PhasedTask]) -> Result<(), IntegrityError> {
    let mut seen = HashSet::new();
    let mut duplicates: Vec<String> = tasks
        .iter()
        .map(PhasedTask::name)
        .filter(|name| !seen.insert(*name))
        .map(str::to_string)
        .collect();

    if duplicates.is_empty() {
        return Ok(());
    }

    duplicates.sort();
    duplicates.dedup();
    Err(IntegrityError::DuplicateTasks(duplicates))
}

fn check_targets(tasks: &[PhasedTask]) -> Result<(), IntegrityError> {
    let mut claims: BTreeMap<&ResourceId, Vec<String>> = BTreeMap::new();

    for task in tasks {
        for target in &task.task.targets {
            claims
                .entry(target)
                .or_default()
                .push(task.name().to_string());
        }
    }

    let mut conflicts = Vec::new();

    for (&target, names) in &claims {
        // claims on the target itself, then on anything inside of it
        let mut all = names.clone();
        for (_, inner) in nested(&claims, target) {
            for name in inner {
                if !all.contains(name) {
                    all.push(name.clone());
                }
            }
        }

        if all.len() > 1 {
            conflicts.push(TargetConflict {
                target: target.clone(),
                tasks: all,
            });
        }
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(IntegrityError::SharedTargets(conflicts))
    }
}

/// Entries of `map` strictly inside the directory `dir`.
fn nested<'a, K, V>(
    map: &'a BTreeMap<K, V>,
    dir: &'a ResourceId,
) -> impl Iterator<Item = (&'a K, &'a V)>
where
    K: Ord + Borrow<ResourceId>,
{
    map.range::<ResourceId, _>((Bound::Excluded(dir), Bound::Unbounded))
        .take_while(move |(key, _)| {
            dir.contains(<K as Borrow<ResourceId>>::borrow(*key))
        })
}

/// Tasks producing `dep`: the owner of `dep` itself, of a directory
/// containing it, or of anything inside of it.
fn producers(owners: &BTreeMap<ResourceId, NodeIndex>, dep: &ResourceId) -> BTreeSet<NodeIndex> {
    let mut found: BTreeSet<NodeIndex> = dep
        .as_path()
        .ancestors()
        .filter(|path| !path.as_str().is_empty())
        .filter_map(|path| owners.get::<Utf8Path>(path).copied())
        .collect();

    found.extend(nested(owners, dep).map(|(_, &owner)| owner));
    found
}

/// Extracts one concrete cycle through `start` from its strongly connected
/// component.
fn find_cycle(graph: &DiGraph<PhasedTask, Link>, start: NodeIndex) -> CycleError {
    let component: HashSet<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .find(|component| component.contains(&start))
        .unwrap_or_else(|| vec![start])
        .into_iter()
        .collect();

    let mut path = vec![start];
    let mut current = start;

    loop {
        let next = graph
            .neighbors_directed(current, Direction::Outgoing)
            .filter(|next| component.contains(next))
            .min();

        let Some(next) = next else {
            break;
        };

        if let Some(position) = path.iter().position(|&index| index == next) {
            path.drain(..position);
            path.push(next);
            break;
        }

        path.push(next);
        current = next;
    }

    CycleError {
        cycle: path
            .into_iter()
            .map(|index| graph[index].name().to_string())
            .collect(),
    }
}
