//! Run scheduler for computing execution order and tracking task states.
//!
//! The scheduler owns the per-run view of a `TaskGraph`: which tasks are
//! pending, running or settled, and which are ready to start. Readiness is
//! strictly by registration order so logs stay stable between runs.

use crate::dag::builder::{TaskGraph, TaskIndex};
use crate::errors::FailureKind;
use crate::task::{Failure, Outcome, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the graph runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum tasks in flight at once
    pub max_parallel: usize,
    /// Delay before retrying an idempotent task after a retryable failure
    #[serde(with = "crate::dag::state::duration_serde")]
    pub retry_backoff: Duration,
    /// How long already-started tasks may keep running after an interrupt
    #[serde(with = "crate::dag::state::duration_serde")]
    pub cancel_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            retry_backoff: Duration::from_millis(500),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

impl RunnerConfig {
    /// Create a config with specific max parallelism (at least 1).
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Status of a task within one run.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TaskStatus {
    /// Waiting to run
    #[default]
    Pending,
    /// Currently executing
    Running,
    /// Outcome recorded
    Settled(Outcome),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Settled(o) if o.is_success())
    }
}

/// Per-run scheduling state over a task graph.
#[derive(Debug)]
pub struct RunScheduler {
    ids: Vec<TaskId>,
    /// Resolved dependencies per task (registration indices)
    reverse_edges: Vec<Vec<TaskIndex>>,
    /// Dependency ids that did not resolve, per task
    unknown: Vec<Vec<TaskId>>,
    status: Vec<TaskStatus>,
}

impl RunScheduler {
    pub fn new(graph: &TaskGraph) -> Self {
        let unknown = graph
            .tasks()
            .iter()
            .map(|t| {
                t.depends_on
                    .iter()
                    .filter(|d| !graph.contains(d))
                    .cloned()
                    .collect()
            })
            .collect();

        Self {
            ids: graph.ids().into_iter().map(String::from).collect(),
            reverse_edges: graph.dependencies(),
            unknown,
            status: vec![TaskStatus::Pending; graph.len()],
        }
    }

    pub fn id(&self, index: TaskIndex) -> &str {
        &self.ids[index]
    }

    pub fn status(&self, index: TaskIndex) -> &TaskStatus {
        &self.status[index]
    }

    /// Compute execution waves: groups of tasks whose dependencies are all in
    /// earlier waves. Used for display only; execution is event-driven.
    pub fn compute_waves(&self) -> Vec<Vec<TaskId>> {
        let mut waves = Vec::new();
        let mut placed: HashSet<TaskIndex> = HashSet::new();

        loop {
            let ready: Vec<TaskIndex> = (0..self.ids.len())
                .filter(|i| !placed.contains(i))
                .filter(|&i| self.reverse_edges[i].iter().all(|d| placed.contains(d)))
                .collect();

            if ready.is_empty() {
                break;
            }
            placed.extend(ready.iter().copied());
            waves.push(ready.into_iter().map(|i| self.ids[i].clone()).collect());
        }

        waves
    }

    /// Pending tasks whose dependencies have all settled, in registration order.
    ///
    /// A returned task either runs or, if [`blocking_failure`](Self::blocking_failure)
    /// reports one, settles as `DependencyFailed` without running.
    pub fn ready(&self) -> Vec<TaskIndex> {
        (0..self.ids.len())
            .filter(|&i| matches!(self.status[i], TaskStatus::Pending))
            .filter(|&i| {
                self.reverse_edges[i]
                    .iter()
                    .all(|&d| self.status[d].is_terminal())
            })
            .collect()
    }

    /// The propagated failure for a task whose dependency failed or is unknown.
    pub fn blocking_failure(&self, index: TaskIndex) -> Option<Failure> {
        if let Some(missing) = self.unknown[index].first() {
            return Some(
                Failure::new(
                    FailureKind::DependencyFailed,
                    format!("dependency '{}' is not a registered task", missing),
                )
                .with_cause(crate::dag::builder::GRAPH_ROOT_ID),
            );
        }

        self.reverse_edges[index].iter().find_map(|&dep| {
            let TaskStatus::Settled(Outcome::Failure(failure)) = &self.status[dep] else {
                return None;
            };
            // Carry the root cause through chains of propagated failures
            let root = match failure.kind {
                FailureKind::DependencyFailed => failure
                    .cause
                    .clone()
                    .unwrap_or_else(|| self.ids[dep].clone()),
                _ => self.ids[dep].clone(),
            };
            Some(
                Failure::new(
                    FailureKind::DependencyFailed,
                    format!("dependency '{}' failed", self.ids[dep]),
                )
                .with_cause(root),
            )
        })
    }

    /// Settled outcomes of a task's direct dependencies.
    pub fn dependency_outcomes(&self, index: TaskIndex) -> Vec<(TaskId, Outcome)> {
        self.reverse_edges[index]
            .iter()
            .filter_map(|&d| match &self.status[d] {
                TaskStatus::Settled(o) => Some((self.ids[d].clone(), o.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn mark_running(&mut self, index: TaskIndex) {
        self.status[index] = TaskStatus::Running;
    }

    /// Record a task's outcome. Outcomes are immutable: settling twice keeps the first.
    pub fn settle(&mut self, index: TaskIndex, outcome: Outcome) {
        if !self.status[index].is_terminal() {
            self.status[index] = TaskStatus::Settled(outcome);
        }
    }

    pub fn unsettled(&self) -> Vec<TaskIndex> {
        (0..self.ids.len())
            .filter(|&i| !self.status[i].is_terminal())
            .collect()
    }

    pub fn all_settled(&self) -> bool {
        self.status.iter().all(TaskStatus::is_terminal)
    }

    pub fn all_success(&self) -> bool {
        self.status.iter().all(TaskStatus::is_success)
    }

    /// Completion percentage over all tasks.
    pub fn completion_percentage(&self) -> f64 {
        if self.status.is_empty() {
            return 100.0;
        }
        let settled = self.status.iter().filter(|s| s.is_terminal()).count();
        (settled as f64 / self.status.len() as f64) * 100.0
    }
}
