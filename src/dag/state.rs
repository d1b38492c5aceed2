//! Execution state and reporting for graph runs.
//!
//! This module provides the aggregate `RunReport` produced by every run,
//! the per-task `TaskReport` entries it is made of, and the `GraphEvent`
//! stream emitted while a run is in progress.

use crate::errors::FailureKind;
use crate::task::{Outcome, TaskId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How a finished graph run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Every task succeeded
    Completed,
    /// One or more tasks failed
    Failed,
    /// Run was interrupted
    Cancelled,
}

/// Report entry for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub outcome: Outcome,
    /// False when the outcome was reused from a previous run or propagated
    /// from a failed dependency without running.
    pub executed: bool,
    /// True when the outcome was carried over from the previous run.
    #[serde(default)]
    pub reused: bool,
    pub attempts: u32,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl TaskReport {
    pub fn is_root_cause(&self) -> bool {
        matches!(self.outcome.failure_kind(), Some(k) if k != FailureKind::DependencyFailed)
    }
}

/// Counts over a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dependency_failed: usize,
    pub reused: usize,
}

/// Aggregate result of one graph run: every task id exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub state: RunState,
    /// Entries in registration order; the synthetic root (if any) first
    pub entries: Vec<TaskReport>,
    /// Task ids in the order their outcomes settled
    pub settle_order: Vec<TaskId>,
}

impl RunReport {
    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.entry(id).map(|e| &e.outcome)
    }

    pub fn entry(&self, id: &str) -> Option<&TaskReport> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn is_success(&self) -> bool {
        self.entries.iter().all(|e| e.outcome.is_success())
    }

    /// Process exit status for this report.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskReport> {
        self.entries.iter().filter(|e| !e.outcome.is_success())
    }

    /// The first failure (in settle order) that did not come from a failed dependency.
    pub fn root_cause(&self) -> Option<&TaskReport> {
        self.settle_order
            .iter()
            .filter_map(|id| self.entry(id))
            .find(|e| e.is_root_cause())
            .or_else(|| self.entries.iter().find(|e| e.is_root_cause()))
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            match entry.outcome.failure_kind() {
                None => summary.succeeded += 1,
                Some(FailureKind::DependencyFailed) => summary.dependency_failed += 1,
                Some(_) => summary.failed += 1,
            }
            if entry.reused {
                summary.reused += 1;
            }
        }
        summary
    }

    /// Persist the report as pretty JSON.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run report to {}", path.display()))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run report {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse run report")
    }
}

/// Events emitted during a graph run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    /// The run has started.
    RunStarted {
        run_id: Uuid,
        tasks: Vec<TaskId>,
        waves: usize,
        incremental: bool,
    },
    /// A task started executing.
    TaskStarted { task: TaskId, attempt: u32 },
    /// A task failed with a retryable failure and will run again.
    TaskRetrying {
        task: TaskId,
        attempt: u32,
        reason: String,
    },
    /// A task outcome settled.
    TaskCompleted {
        task: TaskId,
        outcome: Outcome,
        executed: bool,
        #[serde(with = "duration_serde")]
        duration: Duration,
    },
    /// A task outcome was reused from the previous run.
    TaskReused { task: TaskId },
    /// The run finished.
    RunCompleted { success: bool, summary: RunSummary },
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization as milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, outcome: Outcome) -> TaskReport {
        TaskReport {
            id: id.to_string(),
            outcome,
            executed: true,
            reused: false,
            attempts: 1,
            duration: Duration::from_millis(5),
        }
    }

    fn report() -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration: Duration::from_millis(20),
            state: RunState::Failed,
            entries: vec![
                entry("manifest", Outcome::success()),
                entry(
                    "ui-bundle",
                    Outcome::failure(FailureKind::BundleError, "syntax error"),
                ),
                entry("main-bundle", Outcome::success()),
                TaskReport {
                    executed: false,
                    attempts: 0,
                    ..entry(
                        "package",
                        Outcome::failure(FailureKind::DependencyFailed, "dependency 'ui-bundle' failed"),
                    )
                },
            ],
            settle_order: vec![
                "manifest".into(),
                "ui-bundle".into(),
                "package".into(),
                "main-bundle".into(),
            ],
        }
    }

    #[test]
    fn test_run_state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RunState::Cancelled).unwrap(), "\"cancelled\"");
        let report: RunReport =
            serde_json::from_str(&serde_json::to_string(&report()).unwrap()).unwrap();
        assert_eq!(report.state, RunState::Failed);
    }

    #[test]
    fn test_root_cause_skips_propagated_failures() {
        let report = report();
        let root = report.root_cause().unwrap();
        assert_eq!(root.id, "ui-bundle");
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failures().count(), 2);
    }

    #[test]
    fn test_summary_counts() {
        let summary = report().summary();
        assert_eq!(
            summary,
            RunSummary {
                total: 4,
                succeeded: 2,
                failed: 1,
                dependency_failed: 1,
                reused: 0,
            }
        );
    }

    #[test]
    fn test_report_persists_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/last-run.json");
        let report = report();

        report.write_to(&path).unwrap();
        let loaded = RunReport::read_from(&path).unwrap();

        assert_eq!(loaded.run_id, report.run_id);
        assert_eq!(loaded.entries.len(), 4);
        assert_eq!(
            loaded.outcome("ui-bundle").and_then(|o| o.failure_kind()),
            Some(FailureKind::BundleError)
        );
    }

    #[test]
    fn test_graph_event_serialization() {
        let event = GraphEvent::TaskStarted {
            task: "manifest".into(),
            attempt: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("task_started"));
        assert!(json.contains("manifest"));
    }
}
