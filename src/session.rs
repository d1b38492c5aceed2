//! Test session graph.
//!
//! Extends the build graph with a room launch and one task per assertion:
//!
//! ```text
//! package ── launch ──┬── assert:renders
//!                     └── assert:exports-colors
//! ```
//!
//! All assertion tasks share the channel opened by `launch`. The launch task
//! is idempotent so a handshake timeout is retried once by the runner; the
//! assertion tasks are not.

use crate::bridge::{BridgeChannel, BridgeController, execute_assertion};
use crate::build::{PACKAGE_TASK, PackageArtifact};
use crate::config::AssertionConfig;
use crate::dag::TaskGraph;
use crate::errors::{FailureKind, GraphError};
use crate::room::Room;
use crate::task::{Failure, Outcome, Task, TaskAction, TaskContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub const LAUNCH_TASK: &str = "launch";

pub fn assertion_task_id(name: &str) -> String {
    format!("assert:{}", name)
}

/// Artifact of the launch task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInfo {
    pub session_id: String,
    pub room: Room,
}

/// Owns the controller and the channel shared by assertion tasks.
pub struct TestSession {
    controller: BridgeController,
    assertions: Vec<AssertionConfig>,
    channel: Mutex<Option<Arc<BridgeChannel>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TestSession {
    pub fn new(controller: BridgeController, assertions: Vec<AssertionConfig>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            assertions,
            channel: Mutex::new(None),
        })
    }

    /// Keep only the named assertions; an empty filter keeps all of them.
    pub fn filter_assertions(assertions: &[AssertionConfig], only: &[String]) -> Vec<AssertionConfig> {
        assertions
            .iter()
            .filter(|a| only.is_empty() || only.iter().any(|name| name == &a.name))
            .cloned()
            .collect()
    }

    pub fn assertions(&self) -> &[AssertionConfig] {
        &self.assertions
    }

    /// Register `launch` and one task per assertion.
    pub fn register(self: &Arc<Self>, graph: &mut TaskGraph) -> Result<(), GraphError> {
        graph.register(
            Task::new(
                LAUNCH_TASK,
                [PACKAGE_TASK],
                Arc::new(LaunchTask {
                    session: Arc::clone(self),
                }),
            )
            .idempotent(true),
        )?;

        for assertion in &self.assertions {
            graph.register(Task::new(
                assertion_task_id(&assertion.name),
                [LAUNCH_TASK],
                Arc::new(AssertTask {
                    session: Arc::clone(self),
                    name: assertion.name.clone(),
                    payload: assertion.payload.clone().unwrap_or(serde_json::Value::Null),
                }),
            ))?;
        }
        Ok(())
    }

    /// The open channel, if `launch` succeeded.
    pub fn channel(&self) -> Option<Arc<BridgeChannel>> {
        lock(&self.channel).clone()
    }

    fn install(&self, channel: BridgeChannel) {
        if let Some(previous) = lock(&self.channel).replace(Arc::new(channel)) {
            previous.teardown();
        }
    }

    /// Close the session channel. Safe to call more than once.
    pub fn teardown(&self) {
        if let Some(channel) = lock(&self.channel).take() {
            channel.teardown();
        }
    }
}

struct LaunchTask {
    session: Arc<TestSession>,
}

#[async_trait]
impl TaskAction for LaunchTask {
    async fn run(&self, ctx: TaskContext) -> Outcome {
        let Some(package) = ctx.artifact::<PackageArtifact>(PACKAGE_TASK) else {
            return Outcome::failure(FailureKind::Internal, "package artifact unavailable");
        };

        let result = tokio::select! {
            result = self.session.controller.launch_attempt(&package) => result,
            _ = ctx.cancel.cancelled() => {
                return Outcome::failure(FailureKind::Cancelled, "launch interrupted");
            }
        };

        match result {
            Ok(channel) => {
                let info = LaunchInfo {
                    session_id: channel.session_id().to_string(),
                    room: channel.room(),
                };
                info!(session_id = %info.session_id, room = %info.room, attempt = ctx.attempt, "room launched");
                self.session.install(channel);
                Outcome::with_artifact(&info)
            }
            Err(e) => Failure::new(e.failure_kind(), e.to_string()).into(),
        }
    }
}

struct AssertTask {
    session: Arc<TestSession>,
    name: String,
    payload: serde_json::Value,
}

#[async_trait]
impl TaskAction for AssertTask {
    async fn run(&self, ctx: TaskContext) -> Outcome {
        let Some(channel) = self.session.channel() else {
            return Outcome::failure(FailureKind::ChannelClosed, "no open bridge channel");
        };
        debug!(name = %self.name, "running assertion");

        tokio::select! {
            outcome = execute_assertion(&channel, &self.name, self.payload.clone()) => outcome,
            _ = ctx.cancel.cancelled() => {
                Outcome::failure(FailureKind::Cancelled, format!("assertion '{}' interrupted", self.name))
            }
        }
    }
}
