//! Task graph construction.
//!
//! `TaskGraph` is the single registry of task definitions for one pipeline.
//! Registration validates as it goes: duplicate ids and cycles are rejected
//! and leave the graph unchanged. Dependencies on ids that are not registered
//! yet are allowed so pipelines can be assembled in any order; ids that are
//! still unknown when the graph runs are reported on the synthetic root task.

use crate::errors::GraphError;
use crate::task::{Task, TaskId};
use std::collections::{HashMap, HashSet};

/// Index into the task list (registration order).
pub type TaskIndex = usize;

/// Id of the synthetic task that carries graph-level problems in a report.
pub const GRAPH_ROOT_ID: &str = "$graph";

/// A validated, acyclic set of tasks.
#[derive(Debug, Default, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index_map: HashMap<TaskId, TaskIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task.
    ///
    /// Fails with `DuplicateTaskId` if the id is taken and with
    /// `CyclicDependency` if the task would close a cycle.
    pub fn register(&mut self, task: Task) -> Result<(), GraphError> {
        if task.id == GRAPH_ROOT_ID || self.index_map.contains_key(&task.id) {
            return Err(GraphError::DuplicateTaskId { id: task.id });
        }

        if let Some(path) = self.find_cycle(&task) {
            return Err(GraphError::CyclicDependency { path });
        }

        self.index_map.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    /// Register a task, builder style.
    pub fn with_task(mut self, task: Task) -> Result<Self, GraphError> {
        self.register(task)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index_of(id).and_then(|i| self.tasks.get(i))
    }

    pub fn index_of(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_map.contains_key(id)
    }

    /// Task ids in registration order.
    pub fn ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    /// Dependency references that do not resolve to a registered task,
    /// as `(task, missing dependency)` pairs.
    pub fn unknown_dependencies(&self) -> Vec<(TaskId, TaskId)> {
        self.tasks
            .iter()
            .flat_map(|t| {
                t.depends_on
                    .iter()
                    .filter(|d| !self.index_map.contains_key(*d))
                    .map(move |d| (t.id.clone(), d.clone()))
            })
            .collect()
    }

    /// Forward edges: index -> indices of tasks that depend on it.
    pub fn dependents(&self) -> Vec<Vec<TaskIndex>> {
        let mut forward = vec![Vec::new(); self.tasks.len()];
        for (to, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if let Some(&from) = self.index_map.get(dep) {
                    forward[from].push(to);
                }
            }
        }
        forward
    }

    /// Reverse edges: index -> indices of the tasks it depends on.
    pub fn dependencies(&self) -> Vec<Vec<TaskIndex>> {
        self.tasks
            .iter()
            .map(|t| {
                t.depends_on
                    .iter()
                    .filter_map(|d| self.index_map.get(d).copied())
                    .collect()
            })
            .collect()
    }

    /// The given ids plus every task that transitively depends on one of them.
    ///
    /// Ids that are not registered are ignored.
    pub fn closure<S: AsRef<str>>(&self, changed: &[S]) -> HashSet<TaskIndex> {
        let forward = self.dependents();
        let mut seen = HashSet::new();
        let mut stack: Vec<TaskIndex> = changed
            .iter()
            .filter_map(|id| self.index_of(id.as_ref()))
            .collect();

        while let Some(idx) = stack.pop() {
            if seen.insert(idx) {
                stack.extend(forward[idx].iter().copied());
            }
        }
        seen
    }

    /// Depth-first search from the candidate task along dependency edges,
    /// tracking the recursion stack. The existing graph is acyclic, so any
    /// cycle must pass through the candidate.
    fn find_cycle(&self, candidate: &Task) -> Option<Vec<TaskId>> {
        let mut stack: Vec<TaskId> = Vec::new();
        let mut on_stack: HashSet<TaskId> = HashSet::new();
        let mut done: HashSet<TaskId> = HashSet::new();
        self.visit(&candidate.id, candidate, &mut stack, &mut on_stack, &mut done)
    }

    fn visit(
        &self,
        node: &str,
        candidate: &Task,
        stack: &mut Vec<TaskId>,
        on_stack: &mut HashSet<TaskId>,
        done: &mut HashSet<TaskId>,
    ) -> Option<Vec<TaskId>> {
        let deps: &[TaskId] = if node == candidate.id {
            &candidate.depends_on
        } else {
            match self.get(node) {
                Some(task) => &task.depends_on,
                // Forward reference: no edges yet
                None => &[],
            }
        };

        stack.push(node.to_string());
        on_stack.insert(node.to_string());

        for dep in deps {
            if on_stack.contains(dep) {
                let start = stack.iter().position(|n| n == dep).unwrap_or(0);
                let mut path = stack[start..].to_vec();
                path.push(dep.clone());
                return Some(path);
            }
            if !done.contains(dep)
                && let Some(path) = self.visit(dep, candidate, stack, on_stack, done)
            {
                return Some(path);
            }
        }

        stack.pop();
        on_stack.remove(node);
        done.insert(node.to_string());
        None
    }
}
