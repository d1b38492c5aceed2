//! Typed error hierarchy for plugkit.
//!
//! Three `thiserror` enums cover the subsystems that can fail outside of a
//! task outcome:
//! - `GraphError`: task registration failures
//! - `BridgeError`: launch and transport failures of a bridge channel
//! - `ReleaseError`: release pipeline guard and collaborator failures
//!
//! Failures that happen *inside* a task are not errors: they are recorded as
//! `Failure` values tagged with a [`FailureKind`], so the runner can keep
//! scheduling unaffected branches.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while registering tasks into a graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate task id: {id}")]
    DuplicateTaskId { id: String },

    #[error("Cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
}

impl GraphError {
    /// The failure kind recorded when this error surfaces in a run report.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::DuplicateTaskId { .. } => FailureKind::DuplicateTaskId,
            Self::CyclicDependency { .. } => FailureKind::CyclicDependency,
            Self::UnknownDependency { .. } => FailureKind::UnknownDependency,
        }
    }
}

/// Errors from launching a room or talking to it over a bridge channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("No ready handshake within {0:?}")]
    LaunchTimeout(Duration),

    #[error("Assertion '{name}' (correlation {correlation_id}) timed out after {timeout:?}")]
    AssertionTimeout {
        name: String,
        correlation_id: u64,
        timeout: Duration,
    },

    #[error("Bridge channel {session_id} is closed")]
    ChannelClosed { session_id: String },

    #[error("Failed to spawn room: {0}")]
    SpawnFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed bridge message: {0}")]
    Codec(String),
}

impl BridgeError {
    /// The failure kind recorded when this error surfaces in a task outcome.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::LaunchTimeout(_) => FailureKind::LaunchTimeout,
            Self::AssertionTimeout { .. } => FailureKind::AssertionTimeout,
            Self::ChannelClosed { .. } => FailureKind::ChannelClosed,
            Self::SpawnFailed(_) | Self::Transport(_) | Self::Codec(_) => FailureKind::ChannelClosed,
        }
    }
}

/// Errors from the release pipeline outside of individual task outcomes.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("Another release is already running in this process")]
    AlreadyRunning,

    #[error("Release lock {path} is held by another process")]
    Locked { path: std::path::PathBuf },

    #[error("Failed to acquire release lock at {path}: {source}")]
    Lock {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Git error: {0}")]
    Git(String),

    #[error("Version file {path}: {message}")]
    VersionFile {
        path: std::path::PathBuf,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<git2::Error> for ReleaseError {
    fn from(err: git2::Error) -> Self {
        Self::Git(err.message().to_string())
    }
}

/// The kind tag carried by every task `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidManifest,
    BundleError,
    PackagingError,
    DependencyFailed,
    LaunchTimeout,
    AssertionTimeout,
    ChannelClosed,
    AssertionFailed,
    AssertionError,
    DirtyWorkingTree,
    InvalidBumpKind,
    VersionFileError,
    TemplateWriteError,
    PushRejected,
    GitError,
    DuplicateTaskId,
    CyclicDependency,
    UnknownDependency,
    Cancelled,
    Internal,
}

/// Coarse error category deciding retry and remediation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad manifest or entry points. Fatal, never retried.
    Configuration,
    /// Bundler failure. Fatal for the task, siblings keep running.
    Build,
    /// Propagated from an upstream failure.
    Dependency,
    /// Launch or channel failure.
    Transport,
    /// The remote assertion itself did not pass.
    Assertion,
    /// Git, version or workflow step failure. Completed steps are not rolled back.
    ReleaseStep,
    /// Malformed task graph.
    Graph,
    /// Run was interrupted.
    Cancelled,
}

impl FailureKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::InvalidManifest | Self::PackagingError => ErrorCategory::Configuration,
            Self::BundleError => ErrorCategory::Build,
            Self::DependencyFailed => ErrorCategory::Dependency,
            Self::LaunchTimeout | Self::AssertionTimeout | Self::ChannelClosed => {
                ErrorCategory::Transport
            }
            Self::AssertionFailed | Self::AssertionError => ErrorCategory::Assertion,
            Self::DirtyWorkingTree
            | Self::InvalidBumpKind
            | Self::VersionFileError
            | Self::TemplateWriteError
            | Self::PushRejected
            | Self::GitError => ErrorCategory::ReleaseStep,
            Self::DuplicateTaskId | Self::CyclicDependency | Self::UnknownDependency => {
                ErrorCategory::Graph
            }
            Self::Cancelled | Self::Internal => ErrorCategory::Cancelled,
        }
    }

    /// Only launch timeouts are retried, and only for idempotent tasks.
    /// Assertion timeouts surface directly since assertions may have side effects.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::LaunchTimeout)
    }

    /// Remediation guidance shown next to release step failures.
    pub fn remediation(self) -> Option<&'static str> {
        match self {
            Self::DirtyWorkingTree => {
                Some("commit or stash local changes, or rerun with --dry-run to preview")
            }
            Self::InvalidBumpKind => Some("use one of: patch, minor, major"),
            Self::VersionFileError => {
                Some("make sure the version file has a \"version\": \"MAJOR.MINOR.PATCH\" field")
            }
            Self::TemplateWriteError => {
                Some("fix the workflow directory permissions; the version file was already bumped")
            }
            Self::PushRejected => Some(
                "pull and rebase, then push the release commit and tag manually (git push --follow-tags)",
            ),
            Self::GitError => Some("inspect the repository state with `git status` before retrying"),
            Self::InvalidManifest => Some("check required fields and entry-point paths in the manifest"),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidManifest => "InvalidManifest",
            Self::BundleError => "BundleError",
            Self::PackagingError => "PackagingError",
            Self::DependencyFailed => "DependencyFailed",
            Self::LaunchTimeout => "LaunchTimeout",
            Self::AssertionTimeout => "AssertionTimeout",
            Self::ChannelClosed => "ChannelClosed",
            Self::AssertionFailed => "AssertionFailed",
            Self::AssertionError => "AssertionError",
            Self::DirtyWorkingTree => "DirtyWorkingTree",
            Self::InvalidBumpKind => "InvalidBumpKind",
            Self::VersionFileError => "VersionFileError",
            Self::TemplateWriteError => "TemplateWriteError",
            Self::PushRejected => "PushRejected",
            Self::GitError => "GitError",
            Self::DuplicateTaskId => "DuplicateTaskId",
            Self::CyclicDependency => "CyclicDependency",
            Self::UnknownDependency => "UnknownDependency",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_cycle_renders_path() {
        let err = GraphError::CyclicDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
        assert_eq!(err.failure_kind(), FailureKind::CyclicDependency);
    }

    #[test]
    fn bridge_error_maps_to_transport_kinds() {
        let err = BridgeError::ChannelClosed {
            session_id: "s1".into(),
        };
        assert_eq!(err.failure_kind(), FailureKind::ChannelClosed);
        assert_eq!(err.failure_kind().category(), ErrorCategory::Transport);

        let err = BridgeError::AssertionTimeout {
            name: "renders".into(),
            correlation_id: 7,
            timeout: Duration::from_secs(1),
        };
        assert!(err.to_string().contains("renders"));
        assert!(!err.failure_kind().is_retryable());
    }

    #[test]
    fn only_launch_timeout_is_retryable() {
        assert!(FailureKind::LaunchTimeout.is_retryable());
        assert!(!FailureKind::AssertionTimeout.is_retryable());
        assert!(!FailureKind::BundleError.is_retryable());
        assert!(!FailureKind::DependencyFailed.is_retryable());
    }

    #[test]
    fn release_kinds_carry_remediation() {
        for kind in [
            FailureKind::DirtyWorkingTree,
            FailureKind::InvalidBumpKind,
            FailureKind::VersionFileError,
            FailureKind::TemplateWriteError,
            FailureKind::PushRejected,
        ] {
            assert_eq!(kind.category(), ErrorCategory::ReleaseStep);
            assert!(kind.remediation().is_some(), "{kind} has no hint");
        }
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::DependencyFailed).unwrap();
        assert_eq!(json, "\"dependency_failed\"");
    }

    #[test]
    fn release_error_converts_from_git2() {
        let err: ReleaseError = git2::Error::from_str("bad ref").into();
        assert!(matches!(err, ReleaseError::Git(ref m) if m == "bad ref"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GraphError::DuplicateTaskId { id: "x".into() });
        assert_std_error(&BridgeError::Transport("x".into()));
        assert_std_error(&ReleaseError::AlreadyRunning);
    }
}
