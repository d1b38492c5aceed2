//! Task definition and outcomes for the plugkit task graph.
//!
//! This module provides:
//! - `Task`: a named unit of work with declared dependencies
//! - `Outcome`: the immutable Success/Failure result of running a task
//! - `TaskContext`: what a running task can see (dependency outcomes, cancellation)
//! - `TaskAction`: the async seam every task body implements

use crate::errors::FailureKind;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identifier of a task, unique within one graph.
pub type TaskId = String;

/// Details of a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

/// Result of running a task. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact: Option<serde_json::Value>,
    },
    Failure(Failure),
}

impl Outcome {
    /// A success with no artifact.
    pub fn success() -> Self {
        Self::Success { artifact: None }
    }

    /// A success carrying a serialized artifact for downstream tasks.
    pub fn with_artifact<T: Serialize>(artifact: &T) -> Self {
        match serde_json::to_value(artifact) {
            Ok(value) => Self::Success {
                artifact: Some(value),
            },
            Err(e) => Self::failure(
                FailureKind::Internal,
                format!("artifact could not be serialized: {}", e),
            ),
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(Failure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            Self::Failure(f) => Some(f),
            Self::Success { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.as_failure().map(|f| f.kind)
    }

    /// Raw artifact value, if this is a success that carries one.
    pub fn artifact(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success { artifact } => artifact.as_ref(),
            Self::Failure(_) => None,
        }
    }

    /// Decode the artifact into a concrete type.
    pub fn artifact_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.artifact()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl From<Failure> for Outcome {
    fn from(failure: Failure) -> Self {
        Self::Failure(failure)
    }
}

/// Everything a running task may observe.
///
/// Tasks see only the settled outcomes of their *direct* dependencies.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// 1 for the first attempt, 2 for a retry.
    pub attempt: u32,
    pub dependencies: HashMap<TaskId, Outcome>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            attempt: 1,
            dependencies: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_dependency(mut self, id: impl Into<TaskId>, outcome: Outcome) -> Self {
        self.dependencies.insert(id.into(), outcome);
        self
    }

    pub fn dependency(&self, id: &str) -> Option<&Outcome> {
        self.dependencies.get(id)
    }

    /// Decode a dependency's artifact.
    pub fn artifact<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        self.dependency(id).and_then(|o| o.artifact_as())
    }
}

/// The body of a task.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Outcome;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> TaskAction for FnAction<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> Outcome {
        (self.0)(ctx).await
    }
}

/// A named unit of work with declared dependencies.
#[derive(Clone)]
pub struct Task {
    pub id: TaskId,
    /// Dependency ids, de-duplicated, in declaration order.
    pub depends_on: Vec<TaskId>,
    pub action: Arc<dyn TaskAction>,
    /// Idempotent tasks may be retried on transient launch failures.
    pub idempotent: bool,
}

impl Task {
    pub fn new<I, S>(id: impl Into<TaskId>, depends_on: I, action: Arc<dyn TaskAction>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        let mut deps: Vec<TaskId> = Vec::new();
        for dep in depends_on {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        Self {
            id: id.into(),
            depends_on: deps,
            action,
            idempotent: true,
        }
    }

    /// Build a task from an async closure.
    pub fn from_fn<I, S, F, Fut>(id: impl Into<TaskId>, depends_on: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Self::new(id, depends_on, Arc::new(FnAction(f)))
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .field("idempotent", &self.idempotent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Bundle {
        path: String,
        hash: String,
    }

    #[test]
    fn test_dependencies_are_deduplicated_in_order() {
        let task = Task::from_fn("pkg", ["b", "a", "b"], |_| async { Outcome::success() });
        assert_eq!(task.depends_on, vec!["b", "a"]);
        assert!(task.idempotent);
    }

    #[test]
    fn test_outcome_artifact_roundtrip() {
        let bundle = Bundle {
            path: "dist/main.bundle.js".into(),
            hash: "abc".into(),
        };
        let outcome = Outcome::with_artifact(&bundle);
        assert!(outcome.is_success());
        assert_eq!(outcome.artifact_as::<Bundle>(), Some(bundle));
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome = Outcome::failure(FailureKind::BundleError, "syntax error");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "bundle_error");
        assert_eq!(json["message"], "syntax error");
        assert!(json.get("cause").is_none());

        let ok = serde_json::to_value(Outcome::success()).unwrap();
        assert_eq!(ok, serde_json::json!({"status": "success"}));
    }

    #[test]
    fn test_failure_display_includes_cause() {
        let failure = Failure::new(FailureKind::DependencyFailed, "dependency 'ui-bundle' failed")
            .with_cause("ui-bundle");
        let text = failure.to_string();
        assert!(text.starts_with("DependencyFailed"));
        assert!(text.contains("caused by ui-bundle"));
    }

    #[tokio::test]
    async fn test_context_exposes_dependency_artifacts() {
        let task = Task::from_fn("pkg", ["main-bundle"], |ctx: TaskContext| async move {
            match ctx.artifact::<Bundle>("main-bundle") {
                Some(b) => Outcome::with_artifact(&b.path),
                None => Outcome::failure(FailureKind::PackagingError, "missing"),
            }
        });
        let ctx = TaskContext::new("pkg").with_dependency(
            "main-bundle",
            Outcome::with_artifact(&Bundle {
                path: "x.js".into(),
                hash: "h".into(),
            }),
        );
        let outcome = task.action.run(ctx).await;
        assert_eq!(outcome.artifact_as::<String>().as_deref(), Some("x.js"));
    }
}
