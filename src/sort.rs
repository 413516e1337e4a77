//! Startup task ordering.
//!
//! The scheduler is a two phase Kahn's algorithm over the registry arena:
//!
//! 1. One pass over the registry in insertion order records the in-degree of
//!    every task, collects tasks without dependencies as roots, and builds the
//!    reverse adjacency (`children`). Unresolved entries, duplicate names and
//!    dangling dependency names abort the sort here.
//! 2. A FIFO queue seeded with the roots is drained. Every dequeued task
//!    releases its children; a child whose in-degree drops to zero is pushed
//!    to the back of the queue.
//!
//! If the drain visits fewer tasks than the registry holds, the rest is stuck
//! behind a cycle. The error names the stalled tasks and the cycles among them.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{InternalError, SortError};
use crate::registry::Registry;
use crate::task::{ExecutionContext, StartupTask};

/// Outcome of a successful [`sort`].
///
/// Holds the root tasks in discovery order and, for every task, the tasks that
/// declared it as a dependency. A consumer may start all roots right away and
/// start a child once every one of its parents completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupSortResult {
    pub(crate) root_tasks: Vec<String>,
    pub(crate) children: BTreeMap<String, Vec<String>>,
    pub(crate) order: Vec<String>,
    pub(crate) main_count: usize,
    pub(crate) worker_count: usize,
}

impl StartupSortResult {
    /// Tasks without dependencies, in registry order.
    pub fn root_tasks(&self) -> &[String] {
        &self.root_tasks
    }

    /// Tasks depending on `name`, in the order they were registered. Unknown
    /// names have no children.
    pub fn children_of(&self, name: &str) -> &[String] {
        self.children.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn children(&self) -> &BTreeMap<String, Vec<String>> {
        &self.children
    }

    /// The order in which tasks left the queue. Every dependency of a task
    /// precedes it.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn main_count(&self) -> usize {
        self.main_count
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Renders the schedule as a Mermaid graph, edges pointing from a task to
    /// the tasks it unlocks.
    pub fn render_mermaid(&self) -> String {
        use std::fmt::Write;

        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        for (i, name) in self.order.iter().enumerate() {
            let name = name.replace('"', "\\\"");
            writeln!(f, "    {i}[\"{name}\"]").unwrap();
        }

        let position = |name: &str| self.order.iter().position(|n| n == name);

        for (source, name) in self.order.iter().enumerate() {
            for child in self.children_of(name) {
                if let Some(target) = position(child) {
                    writeln!(f, "    {source} --> {target}").unwrap();
                }
            }
        }

        f
    }
}

/// The startup task scheduler.
///
/// Stateless; every call works on fresh local structures, so concurrent calls
/// on distinct (or shared, immutable) registries are independent.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartupTopologySort;

impl StartupTopologySort {
    pub fn sort<T: StartupTask>(registry: &Registry<T>) -> Result<StartupSortResult, SortError> {
        sort(registry)
    }
}

/// Orders `registry` for execution, see the [module docs](self).
pub fn sort<T: StartupTask>(registry: &Registry<T>) -> Result<StartupSortResult, SortError> {
    let total = registry.len();

    let mut in_degree = vec![0usize; total];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); total];
    let mut names = HashSet::with_capacity(total);
    let mut queue = VecDeque::new();
    let mut roots = Vec::new();

    for (index, entry) in registry.entries.iter().enumerate() {
        let Some(task) = &entry.task else {
            tracing::error!("startup task is null: {}", entry.key);
            return Err(InternalError::UnresolvedTask {
                key: entry.key.clone(),
            }
            .into());
        };

        let name = task.name();
        if !names.insert(name) {
            tracing::error!("{name}, failed to emplace to in-degree map");
            return Err(InternalError::DuplicateTask {
                name: name.to_string(),
            }
            .into());
        }

        if name != entry.key {
            tracing::error!("startup task {name} is registered as {}", entry.key);
            return Err(InternalError::KeyMismatch {
                key: entry.key.clone(),
                name: name.to_string(),
            }
            .into());
        }

        let dependencies = task.dependencies();
        if task.dependencies_count() != dependencies.len() {
            tracing::warn!(
                "{name} declares {} dependencies but lists {}",
                task.dependencies_count(),
                dependencies.len()
            );
        }

        in_degree[index] = dependencies.len();

        if dependencies.is_empty() {
            queue.push_back(index);
            roots.push(index);
            continue;
        }

        for dependency in dependencies {
            let Some(parent) = registry.position(dependency) else {
                tracing::error!("{name}, failed to find dep: {dependency}");
                return Err(SortError::DependencyNotFound {
                    task: name.to_string(),
                    dependency: dependency.clone(),
                });
            };

            children[parent].push(index);
        }
    }

    let mut order = Vec::with_capacity(total);
    let mut main = 0;
    let mut worker = 0;

    while let Some(index) = queue.pop_front() {
        let Some(task) = registry.entries.get(index).and_then(|e| e.task.as_ref()) else {
            let name = registry
                .entries
                .get(index)
                .map(|e| e.key.clone())
                .unwrap_or_default();
            tracing::error!("startup task not found: {name}");
            return Err(InternalError::MissingDuringDrain { name }.into());
        };

        match task.context() {
            ExecutionContext::Main => main += 1,
            ExecutionContext::Worker => worker += 1,
        }
        order.push(index);

        for &child in &children[index] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    if main + worker != total {
        tracing::error!("circular dependency, main: {main}, thread: {worker}, tasks: {total}");

        let stalled = (0..total)
            .filter(|&index| in_degree[index] > 0)
            .map(|index| registry.entries[index].key.clone())
            .collect();

        return Err(SortError::CircularDependency {
            main,
            worker,
            total,
            stalled,
            cycles: crate::graph::find_cycles(registry),
        });
    }

    tracing::debug!("main: {main}, thread: {worker}");

    let key = |index: usize| registry.entries[index].key.clone();

    Ok(StartupSortResult {
        root_tasks: roots.into_iter().map(key).collect(),
        children: children
            .into_iter()
            .enumerate()
            .map(|(index, list)| (key(index), list.into_iter().map(key).collect()))
            .collect(),
        order: order.into_iter().map(key).collect(),
        main_count: main,
        worker_count: worker,
    })
}
