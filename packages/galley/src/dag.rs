//! The dependency graph of tasks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use derive_more::Display;
use itertools::Itertools;

use crate::task::{Task, TaskId};

/// The graph contains a dependency cycle. Detected before execution
/// begins; fatal for the run.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("cyclic dependency graph through: {}", cycle.iter().join(", "))]
pub struct CyclicDag {
    /// The tasks involved in (or downstream of) the cycle.
    pub cycle: Vec<TaskId>,
}

impl std::error::Error for CyclicDag {}

/// A digraph with tasks as vertices; an edge `u -> v` means
/// "`u` depends on `v`".
#[derive(Clone, Debug)]
pub struct Dag<T> {
    tasks: BTreeMap<TaskId, T>,
    deps: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

impl<T: Task> Default for Dag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Task> Dag<T> {
    /// An empty graph.
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            deps: BTreeMap::new(),
        }
    }

    /// Add a task as a vertex. Adding a task with an identity already
    /// present replaces the previous task and keeps its edges.
    pub fn add_task(&mut self, task: T) -> TaskId {
        let id = task.id();
        self.tasks.insert(id.clone(), task);
        self.deps.entry(id.clone()).or_default();
        id
    }

    /// Record that `task` depends on `on`.
    /// Both vertices must already be present.
    pub fn add_dep(&mut self, task: &TaskId, on: &TaskId) -> Result<(), UnknownTask> {
        for id in [task, on] {
            if !self.tasks.contains_key(id) {
                return Err(UnknownTask { id: id.clone() });
            }
        }
        self.deps
            .entry(task.clone())
            .or_default()
            .insert(on.clone());
        Ok(())
    }

    /// Look up a task by identity.
    pub fn task(&self, id: &TaskId) -> Option<&T> {
        self.tasks.get(id)
    }

    /// The identities of every vertex.
    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.keys()
    }

    /// The direct dependencies of a task.
    pub fn deps_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.deps
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every edge `(task, dependency)` in the graph.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.deps
            .iter()
            .flat_map(|(task, deps)| deps.iter().map(move |on| (task.clone(), on.clone())))
            .collect()
    }

    /// The number of vertices.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Order the vertices so that every task comes after its
    /// dependencies, or fail with [`CyclicDag`].
    pub fn toposort(&self) -> Result<Vec<TaskId>, CyclicDag> {
        let mut pending = self
            .deps
            .iter()
            .map(|(id, deps)| (id.clone(), deps.len()))
            .collect::<BTreeMap<_, _>>();

        let mut dependents: BTreeMap<&TaskId, Vec<&TaskId>> = BTreeMap::new();
        for (task, deps) in &self.deps {
            for on in deps {
                dependents.entry(on).or_default().push(task);
            }
        }

        let mut queue = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect::<VecDeque<_>>();

        let mut sorted = Vec::with_capacity(self.tasks.len());
        while let Some(id) = queue.pop_front() {
            pending.remove(&id);
            for dependent in dependents.get(&id).into_iter().flatten() {
                let count = pending
                    .get_mut(*dependent)
                    .expect("dependent still pending");
                *count -= 1;
                if *count == 0 {
                    queue.push_back((*dependent).clone());
                }
            }
            sorted.push(id);
        }

        if sorted.len() != self.tasks.len() {
            return Err(CyclicDag {
                cycle: pending.into_keys().collect(),
            });
        }
        Ok(sorted)
    }
}

/// An edge referenced a task that was never added.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("unknown task: {id}")]
pub struct UnknownTask {
    pub id: TaskId,
}

impl std::error::Error for UnknownTask {}
