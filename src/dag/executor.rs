//! Graph runner for dependency-ordered task execution.
//!
//! The runner executes a `TaskGraph` on the current async task: independent
//! tasks are polled concurrently through a `FuturesUnordered` set and joined
//! before their dependents start. A failed task fails every dependent with
//! `DependencyFailed` without running it, while unrelated branches continue.
//! `run` never returns an error; everything lands in the `RunReport`.

use crate::dag::builder::{GRAPH_ROOT_ID, TaskGraph, TaskIndex};
use crate::dag::scheduler::{RunScheduler, RunnerConfig};
use crate::dag::state::{ExecutionTimer, GraphEvent, RunReport, RunState, TaskReport};
use crate::errors::FailureKind;
use crate::task::{Failure, Outcome, Task, TaskContext, TaskId};
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a finished task future reports back to the run loop.
struct Completion {
    index: TaskIndex,
    outcome: Outcome,
    attempts: u32,
    duration: Duration,
}

/// Executes task graphs and remembers the last outcome of every task so
/// later incremental runs can reuse them.
pub struct GraphRunner {
    config: RunnerConfig,
    cache: HashMap<TaskId, Outcome>,
    event_tx: Option<mpsc::Sender<GraphEvent>>,
}

impl GraphRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<GraphEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Stop emitting events; the receiver sees the channel close.
    pub fn without_event_channel(mut self) -> Self {
        self.event_tx = None;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The outcome cached from the most recent run that settled this task.
    pub fn cached(&self, id: &str) -> Option<&Outcome> {
        self.cache.get(id)
    }

    /// Run the graph to completion.
    ///
    /// With `changed` set, only those tasks and their transitive dependents
    /// execute; every other task reuses its cached outcome (tasks without one
    /// still execute).
    pub async fn run(&mut self, graph: &TaskGraph, changed: Option<&[TaskId]>) -> RunReport {
        self.run_until(graph, changed, CancellationToken::new()).await
    }

    /// Run the graph until completion or until `cancel` fires.
    ///
    /// After cancellation no new task starts. Running tasks observe the token
    /// through their context and get `cancel_grace` to settle; anything still
    /// unsettled afterwards is recorded as `Cancelled`.
    pub async fn run_until(
        &mut self,
        graph: &TaskGraph,
        changed: Option<&[TaskId]>,
        cancel: CancellationToken,
    ) -> RunReport {
        let timer = ExecutionTimer::start();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut sched = RunScheduler::new(graph);
        let mut entries: Vec<Option<TaskReport>> = vec![None; graph.len()];
        let mut settle_order: Vec<TaskId> = Vec::new();

        let waves = sched.compute_waves();
        info!(
            run = %run_id,
            tasks = graph.len(),
            waves = waves.len(),
            incremental = changed.is_some(),
            "starting graph run"
        );
        self.emit(GraphEvent::RunStarted {
            run_id,
            tasks: graph.ids().into_iter().map(String::from).collect(),
            waves: waves.len(),
            incremental: changed.is_some(),
        })
        .await;

        let root_entry = graph_root_entry(graph);
        if let Some(root) = &root_entry {
            settle_order.push(root.id.clone());
        }

        // Reuse cached outcomes outside the changed closure
        if let Some(changed) = changed {
            let closure = graph.closure(changed);
            for id in changed {
                if !graph.contains(id) {
                    warn!(task = %id, "changed task id is not registered; ignoring");
                }
            }
            for (index, task) in graph.tasks().iter().enumerate() {
                if closure.contains(&index) {
                    continue;
                }
                if let Some(cached) = self.cache.get(&task.id).cloned() {
                    debug!(task = %task.id, "reusing cached outcome");
                    sched.settle(index, cached.clone());
                    entries[index] = Some(TaskReport {
                        id: task.id.clone(),
                        outcome: cached,
                        executed: false,
                        reused: true,
                        attempts: 0,
                        duration: Duration::ZERO,
                    });
                    settle_order.push(task.id.clone());
                    self.emit(GraphEvent::TaskReused {
                        task: task.id.clone(),
                    })
                    .await;
                }
            }
        }

        let mut in_flight: FuturesUnordered<BoxFuture<'static, Completion>> =
            FuturesUnordered::new();
        let mut cancelled = cancel.is_cancelled();

        loop {
            // Start everything that is ready, settling blocked tasks as we go
            let mut progressed = true;
            while progressed && !cancelled {
                progressed = false;
                for index in sched.ready() {
                    if let Some(failure) = sched.blocking_failure(index) {
                        let id = sched.id(index).to_string();
                        debug!(task = %id, reason = %failure.message, "skipping task");
                        let outcome = Outcome::Failure(failure);
                        sched.settle(index, outcome.clone());
                        settle_order.push(id.clone());
                        self.emit(GraphEvent::TaskCompleted {
                            task: id.clone(),
                            outcome: outcome.clone(),
                            executed: false,
                            duration: Duration::ZERO,
                        })
                        .await;
                        entries[index] = Some(TaskReport {
                            id,
                            outcome,
                            executed: false,
                            reused: false,
                            attempts: 0,
                            duration: Duration::ZERO,
                        });
                        progressed = true;
                        continue;
                    }

                    if in_flight.len() >= self.config.max_parallel {
                        continue;
                    }

                    let task = graph.tasks()[index].clone();
                    let deps: HashMap<TaskId, Outcome> =
                        sched.dependency_outcomes(index).into_iter().collect();
                    sched.mark_running(index);
                    self.emit(GraphEvent::TaskStarted {
                        task: task.id.clone(),
                        attempt: 1,
                    })
                    .await;
                    in_flight.push(
                        execute_task(
                            index,
                            task,
                            deps,
                            cancel.child_token(),
                            self.config.retry_backoff,
                            self.event_tx.clone(),
                        )
                        .boxed(),
                    );
                    progressed = true;
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(done) = in_flight.next() => {
                    self.record_completion(&mut sched, &mut entries, &mut settle_order, done).await;
                }
                _ = cancel.cancelled(), if !cancelled => {
                    warn!(run = %run_id, "run cancelled; waiting for started tasks to settle");
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            let grace = tokio::time::sleep(self.config.cancel_grace);
            tokio::pin!(grace);
            while !in_flight.is_empty() {
                tokio::select! {
                    Some(done) = in_flight.next() => {
                        self.record_completion(&mut sched, &mut entries, &mut settle_order, done).await;
                    }
                    _ = &mut grace => break,
                }
            }
            drop(in_flight);

            for index in sched.unsettled() {
                let was_running = matches!(
                    sched.status(index),
                    crate::dag::scheduler::TaskStatus::Running
                );
                let message = if was_running {
                    "interrupted before completion"
                } else {
                    "not started: run was cancelled"
                };
                let id = sched.id(index).to_string();
                let outcome = Outcome::failure(FailureKind::Cancelled, message);
                sched.settle(index, outcome.clone());
                settle_order.push(id.clone());
                entries[index] = Some(TaskReport {
                    id,
                    outcome,
                    executed: was_running,
                    reused: false,
                    attempts: u32::from(was_running),
                    duration: Duration::ZERO,
                });
            }
        }

        let mut report_entries: Vec<TaskReport> = Vec::with_capacity(graph.len() + 1);
        report_entries.extend(root_entry);
        for (index, entry) in entries.into_iter().enumerate() {
            // Every index settles above; the fallback only guards against scheduler bugs
            let entry = entry.unwrap_or_else(|| TaskReport {
                id: sched.id(index).to_string(),
                outcome: Outcome::failure(FailureKind::Internal, "task never settled"),
                executed: false,
                reused: false,
                attempts: 0,
                duration: Duration::ZERO,
            });
            self.cache.insert(entry.id.clone(), entry.outcome.clone());
            report_entries.push(entry);
        }

        let mut report = RunReport {
            run_id,
            started_at,
            duration: timer.elapsed(),
            state: RunState::Completed,
            entries: report_entries,
            settle_order,
        };
        report.state = if cancelled {
            RunState::Cancelled
        } else if report.is_success() {
            RunState::Completed
        } else {
            RunState::Failed
        };

        let summary = report.summary();
        info!(
            run = %run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            dependency_failed = summary.dependency_failed,
            reused = summary.reused,
            "graph run finished"
        );
        self.emit(GraphEvent::RunCompleted {
            success: report.is_success(),
            summary,
        })
        .await;

        report
    }

    async fn record_completion(
        &self,
        sched: &mut RunScheduler,
        entries: &mut [Option<TaskReport>],
        settle_order: &mut Vec<TaskId>,
        done: Completion,
    ) {
        let id = sched.id(done.index).to_string();
        match done.outcome.as_failure() {
            Some(f) => warn!(task = %id, kind = %f.kind, "task failed: {}", f.message),
            None => debug!(task = %id, attempts = done.attempts, "task succeeded"),
        }
        sched.settle(done.index, done.outcome.clone());
        settle_order.push(id.clone());
        self.emit(GraphEvent::TaskCompleted {
            task: id.clone(),
            outcome: done.outcome.clone(),
            executed: true,
            duration: done.duration,
        })
        .await;
        entries[done.index] = Some(TaskReport {
            id,
            outcome: done.outcome,
            executed: true,
            reused: false,
            attempts: done.attempts,
            duration: done.duration,
        });
    }

    /// Emit an event to the event channel if configured.
    async fn emit(&self, event: GraphEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// The synthetic root entry describing graph-level problems, if any.
fn graph_root_entry(graph: &TaskGraph) -> Option<TaskReport> {
    let unknown = graph.unknown_dependencies();
    if unknown.is_empty() {
        return None;
    }
    let detail = unknown
        .iter()
        .map(|(task, dep)| format!("'{}' depends on unknown task '{}'", task, dep))
        .collect::<Vec<_>>()
        .join("; ");
    Some(TaskReport {
        id: GRAPH_ROOT_ID.to_string(),
        outcome: Outcome::Failure(Failure::new(FailureKind::UnknownDependency, detail)),
        executed: false,
        reused: false,
        attempts: 0,
        duration: Duration::ZERO,
    })
}

/// Run one task, retrying once after `backoff` if it is idempotent and
/// failed with a retryable kind.
async fn execute_task(
    index: TaskIndex,
    task: Task,
    dependencies: HashMap<TaskId, Outcome>,
    cancel: CancellationToken,
    backoff: Duration,
    event_tx: Option<mpsc::Sender<GraphEvent>>,
) -> Completion {
    const MAX_ATTEMPTS: u32 = 2;

    let timer = ExecutionTimer::start();
    let mut attempt = 1;

    loop {
        let ctx = TaskContext {
            task_id: task.id.clone(),
            attempt,
            dependencies: dependencies.clone(),
            cancel: cancel.clone(),
        };

        let outcome = match AssertUnwindSafe(task.action.run(ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::failure(FailureKind::Internal, "task panicked"),
        };

        let retry = match outcome.as_failure() {
            Some(f) => {
                task.idempotent
                    && f.kind.is_retryable()
                    && attempt < MAX_ATTEMPTS
                    && !cancel.is_cancelled()
            }
            None => false,
        };

        if !retry {
            return Completion {
                index,
                outcome,
                attempts: attempt,
                duration: timer.elapsed(),
            };
        }

        let reason = outcome
            .as_failure()
            .map(|f| f.to_string())
            .unwrap_or_default();
        warn!(task = %task.id, attempt, "retrying after {:?}: {}", backoff, reason);
        attempt += 1;
        if let Some(ref tx) = event_tx {
            tx.send(GraphEvent::TaskRetrying {
                task: task.id.clone(),
                attempt,
                reason,
            })
            .await
            .ok();
        }
        tokio::time::sleep(backoff).await;
    }
}
