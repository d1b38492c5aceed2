//! Release pipeline.
//!
//! A strictly sequential task graph:
//!
//! ```text
//! git-status ── version-bump ── workflow-sync ── push
//!                      │                          │
//!                      └──────────────────────────┘
//! ```
//!
//! A failure anywhere leaves downstream steps as `DependencyFailed`.
//! Completed steps are not rolled back; the report carries remediation
//! hints instead. Only one release may run per process, and the lock file
//! under the state directory keeps concurrent processes out as well.

pub mod git;
pub mod version;
pub mod workflows;

pub use git::{Git2Collaborator, GitCollaborator, GitStatus, PushResult};
pub use version::{BumpKind, Version, VersionError, VersionFile};
pub use workflows::{SyncedWorkflow, TemplateVars, WorkflowError};

use crate::config::PlugkitConfig;
use crate::dag::{GraphRunner, RunReport, RunnerConfig, TaskGraph};
use crate::errors::{FailureKind, GraphError, ReleaseError};
use crate::task::{Failure, Outcome, Task, TaskAction, TaskContext};
use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const GIT_STATUS_TASK: &str = "git-status";
pub const VERSION_BUMP_TASK: &str = "version-bump";
pub const WORKFLOW_SYNC_TASK: &str = "workflow-sync";
pub const PUSH_TASK: &str = "push";

/// Record of one release invocation, filled in pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseState {
    pub current_version: Option<Version>,
    pub git_is_clean: bool,
    pub pushed: bool,
}

/// Artifact of the version-bump task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBump {
    pub from: Version,
    pub to: Version,
    pub written: bool,
}

/// Lock files of the releases running in this process.
static IN_FLIGHT: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Held for the duration of a release. The in-process set catches a second
/// release from this process; the file lock catches other processes.
pub struct ReleaseGuard {
    lock_path: PathBuf,
    lock_file: File,
}

impl ReleaseGuard {
    pub fn acquire(lock_path: &Path) -> Result<Self, ReleaseError> {
        if !lock(&IN_FLIGHT).insert(lock_path.to_path_buf()) {
            return Err(ReleaseError::AlreadyRunning);
        }

        match Self::open_lock(lock_path) {
            Ok(lock_file) => Ok(Self {
                lock_path: lock_path.to_path_buf(),
                lock_file,
            }),
            Err(e) => {
                lock(&IN_FLIGHT).remove(lock_path);
                Err(e)
            }
        }
    }

    fn open_lock(lock_path: &Path) -> Result<File, ReleaseError> {
        let lock_err = |source| ReleaseError::Lock {
            path: lock_path.to_path_buf(),
            source,
        };
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(lock_err)?;
        }
        let file = File::create(lock_path).map_err(lock_err)?;
        file.try_lock_exclusive().map_err(|_| ReleaseError::Locked {
            path: lock_path.to_path_buf(),
        })?;
        Ok(file)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock_file) {
            warn!(error = %e, "failed to release the release lock");
        }
        lock(&IN_FLIGHT).remove(&self.lock_path);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything one release invocation needs.
pub struct ReleasePipeline {
    pub bump: String,
    pub dry_run: bool,
    pub version_file: PathBuf,
    pub workflows_dir: PathBuf,
    pub lock_path: PathBuf,
    pub plugin_name: String,
    pub node_version: String,
    pub git: Arc<dyn GitCollaborator>,
}

impl ReleasePipeline {
    /// The pipeline as configured, with the libgit2 collaborator.
    pub fn from_config(config: &PlugkitConfig, bump: &str, dry_run: bool) -> Self {
        let release = &config.toml.release;
        let git = Git2Collaborator::new(&config.project_dir, release.remote.clone())
            .with_branch(release.branch.clone())
            .ignoring(&config.state_dir())
            .ignoring(&config.out_dir());

        Self {
            bump: bump.to_string(),
            dry_run,
            version_file: config.version_file(),
            workflows_dir: config.workflows_dir(),
            lock_path: config.release_lock_file(),
            plugin_name: plugin_name(config),
            node_version: release.node_version.clone(),
            git: Arc::new(git),
        }
    }

    /// Register the four release tasks sharing `state`.
    pub fn register(
        &self,
        graph: &mut TaskGraph,
        state: Arc<Mutex<ReleaseState>>,
    ) -> Result<(), GraphError> {
        graph.register(Task::new(
            GIT_STATUS_TASK,
            Vec::<String>::new(),
            Arc::new(GitStatusTask {
                git: self.git.clone(),
                dry_run: self.dry_run,
                state: state.clone(),
            }),
        ))?;
        graph.register(Task::new(
            VERSION_BUMP_TASK,
            [GIT_STATUS_TASK],
            Arc::new(VersionBumpTask {
                bump: self.bump.clone(),
                file: VersionFile::new(&self.version_file),
                dry_run: self.dry_run,
                state: state.clone(),
            }),
        ))?;
        graph.register(Task::new(
            WORKFLOW_SYNC_TASK,
            [VERSION_BUMP_TASK],
            Arc::new(WorkflowSyncTask {
                dir: self.workflows_dir.clone(),
                plugin_name: self.plugin_name.clone(),
                node_version: self.node_version.clone(),
                dry_run: self.dry_run,
            }),
        ))?;
        // Push reads the bump artifact directly, so it depends on it too.
        graph.register(Task::new(
            PUSH_TASK,
            [VERSION_BUMP_TASK, WORKFLOW_SYNC_TASK],
            Arc::new(PushTask {
                git: self.git.clone(),
                version_file: self.version_file.clone(),
                dry_run: self.dry_run,
                state,
            }),
        ))?;
        Ok(())
    }

    /// Take the single-flight guard and build the release graph. Fails with
    /// `AlreadyRunning` or `Locked` before any task exists.
    pub fn prepare(&self) -> Result<PreparedRelease, ReleaseError> {
        let guard = ReleaseGuard::acquire(&self.lock_path)?;
        let state = Arc::new(Mutex::new(ReleaseState::default()));
        let mut graph = TaskGraph::new();
        self.register(&mut graph, state.clone())
            .map_err(|e| ReleaseError::Other(e.into()))?;
        info!(bump = %self.bump, dry_run = self.dry_run, "release prepared");
        Ok(PreparedRelease {
            graph,
            state,
            _guard: guard,
        })
    }

    /// Run the release to completion.
    pub async fn run(
        &self,
        runner_config: RunnerConfig,
        cancel: CancellationToken,
    ) -> Result<(RunReport, ReleaseState), ReleaseError> {
        let prepared = self.prepare()?;
        let mut runner = GraphRunner::new(runner_config);
        let report = runner.run_until(&prepared.graph, None, cancel).await;
        Ok((report, prepared.state()))
    }
}

/// A release graph ready to run. The guard is held until this is dropped.
pub struct PreparedRelease {
    pub graph: TaskGraph,
    state: Arc<Mutex<ReleaseState>>,
    _guard: ReleaseGuard,
}

impl PreparedRelease {
    /// Snapshot of the state the tasks have recorded so far.
    pub fn state(&self) -> ReleaseState {
        lock(&self.state).clone()
    }
}

/// Name used in workflow templates: the manifest name, then
/// `[project].name`, then the project directory name.
fn plugin_name(config: &PlugkitConfig) -> String {
    if let Ok(content) = std::fs::read_to_string(config.manifest_path())
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&content)
        && let Some(name) = value.get("name").and_then(|n| n.as_str())
    {
        return name.to_string();
    }
    if let Some(name) = &config.toml.project.name {
        return name.clone();
    }
    config
        .project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugin".to_string())
}

struct GitStatusTask {
    git: Arc<dyn GitCollaborator>,
    dry_run: bool,
    state: Arc<Mutex<ReleaseState>>,
}

#[async_trait]
impl TaskAction for GitStatusTask {
    async fn run(&self, _ctx: TaskContext) -> Outcome {
        let status = match self.git.status().await {
            Ok(status) => status,
            Err(e) => return Outcome::failure(FailureKind::GitError, e.to_string()),
        };
        lock(&self.state).git_is_clean = status.clean;

        if !status.clean {
            let summary = status.dirty.join(", ");
            if !self.dry_run {
                return Failure::new(
                    FailureKind::DirtyWorkingTree,
                    format!("Working tree has uncommitted changes: {}", summary),
                )
                .into();
            }
            warn!(dirty = %summary, "working tree is dirty (dry run continues)");
        }
        Outcome::with_artifact(&status)
    }
}

struct VersionBumpTask {
    bump: String,
    file: VersionFile,
    dry_run: bool,
    state: Arc<Mutex<ReleaseState>>,
}

#[async_trait]
impl TaskAction for VersionBumpTask {
    async fn run(&self, _ctx: TaskContext) -> Outcome {
        let kind: BumpKind = match self.bump.parse() {
            Ok(kind) => kind,
            Err(e) => return Outcome::failure(FailureKind::InvalidBumpKind, format!("{}", e)),
        };

        match self.file.bump(kind, self.dry_run) {
            Ok((from, to)) => {
                info!(from = %from, to = %to, dry_run = self.dry_run, "version bumped");
                lock(&self.state).current_version = Some(to.clone());
                Outcome::with_artifact(&VersionBump {
                    from,
                    to,
                    written: !self.dry_run,
                })
            }
            Err(e) => Outcome::failure(FailureKind::VersionFileError, e.to_string()),
        }
    }
}

struct WorkflowSyncTask {
    dir: PathBuf,
    plugin_name: String,
    node_version: String,
    dry_run: bool,
}

#[async_trait]
impl TaskAction for WorkflowSyncTask {
    async fn run(&self, ctx: TaskContext) -> Outcome {
        let Some(bump) = ctx.artifact::<VersionBump>(VERSION_BUMP_TASK) else {
            return Outcome::failure(FailureKind::Internal, "version bump artifact unavailable");
        };
        let vars = TemplateVars {
            plugin_name: self.plugin_name.clone(),
            version: bump.to.to_string(),
            node_version: self.node_version.clone(),
        };

        match workflows::sync(&self.dir, &vars, self.dry_run) {
            Ok(synced) => {
                let changed = synced.iter().filter(|w| w.changed).count();
                info!(changed, dry_run = self.dry_run, "workflow templates synced");
                Outcome::with_artifact(&synced)
            }
            Err(e) => Outcome::failure(FailureKind::TemplateWriteError, e.to_string()),
        }
    }
}

struct PushTask {
    git: Arc<dyn GitCollaborator>,
    version_file: PathBuf,
    dry_run: bool,
    state: Arc<Mutex<ReleaseState>>,
}

#[async_trait]
impl TaskAction for PushTask {
    async fn run(&self, ctx: TaskContext) -> Outcome {
        let Some(bump) = ctx.artifact::<VersionBump>(VERSION_BUMP_TASK) else {
            return Outcome::failure(FailureKind::Internal, "version bump artifact unavailable");
        };
        let synced: Vec<SyncedWorkflow> = ctx.artifact(WORKFLOW_SYNC_TASK).unwrap_or_default();

        if self.dry_run {
            info!(tag = %bump.to.tag(), "dry run: skipping commit and push");
            return Outcome::with_artifact(&PushResult {
                accepted: false,
                reason: Some("dry run".to_string()),
            });
        }

        let mut paths = vec![self.version_file.clone()];
        paths.extend(synced.into_iter().map(|w| w.path));
        if let Err(e) = self.git.commit_release(&bump.to, &paths).await {
            return Outcome::failure(FailureKind::GitError, e.to_string());
        }

        match self.git.push().await {
            Ok(result) if result.accepted => {
                lock(&self.state).pushed = true;
                info!(tag = %bump.to.tag(), "release pushed");
                Outcome::with_artifact(&result)
            }
            Ok(result) => Outcome::failure(
                FailureKind::PushRejected,
                result
                    .reason
                    .unwrap_or_else(|| "push rejected by remote".to_string()),
            ),
            Err(e) => Outcome::failure(FailureKind::GitError, e.to_string()),
        }
    }
}
