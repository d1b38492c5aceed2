//! Build pipeline.
//!
//! A fixed task graph:
//!
//! ```text
//! manifest ──┬── ui-bundle ───┐
//!            └── main-bundle ─┴── package
//! ```
//!
//! `ui-bundle` and `main-bundle` do not depend on each other. `package`
//! depends on all three and writes the canonical layout under `out_dir`.

pub mod bundler;
pub mod manifest;
pub mod package;

pub use bundler::{BundleArtifact, BundleError, BundleRequest, BundleTarget, Bundler, CommandBundler};
pub use manifest::{ManifestArtifact, ManifestError, PluginManifest, load_manifest};
pub use package::{PackageArtifact, PackageError};

use crate::config::PlugkitConfig;
use crate::dag::TaskGraph;
use crate::errors::{FailureKind, GraphError};
use crate::task::{Failure, Outcome, Task, TaskAction, TaskContext};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const MANIFEST_TASK: &str = "manifest";
pub const UI_BUNDLE_TASK: &str = "ui-bundle";
pub const MAIN_BUNDLE_TASK: &str = "main-bundle";
pub const PACKAGE_TASK: &str = "package";

/// Task id of the bundle task for a target.
pub fn bundle_task_id(target: BundleTarget) -> &'static str {
    match target {
        BundleTarget::Ui => UI_BUNDLE_TASK,
        BundleTarget::Main => MAIN_BUNDLE_TASK,
    }
}

/// Where the build pipeline reads from and writes to.
#[derive(Clone)]
pub struct BuildPipeline {
    pub manifest_path: PathBuf,
    pub out_dir: PathBuf,
    /// Per-target bundler output lands in `{staging_root}/{target}`
    pub staging_root: PathBuf,
    pub bundler: Arc<dyn Bundler>,
}

impl BuildPipeline {
    pub fn new(
        manifest_path: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        staging_root: impl Into<PathBuf>,
        bundler: Arc<dyn Bundler>,
    ) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            out_dir: out_dir.into(),
            staging_root: staging_root.into(),
            bundler,
        }
    }

    /// The pipeline as configured, using the command bundler.
    pub fn from_config(config: &PlugkitConfig) -> Self {
        Self::new(
            config.manifest_path(),
            config.out_dir(),
            config.state_dir().join("staging"),
            Arc::new(CommandBundler::from_config(config)),
        )
    }

    /// Register the four build tasks.
    pub fn register(&self, graph: &mut TaskGraph) -> Result<(), GraphError> {
        graph.register(Task::new(
            MANIFEST_TASK,
            Vec::<String>::new(),
            Arc::new(ManifestTask {
                path: self.manifest_path.clone(),
            }),
        ))?;
        for target in [BundleTarget::Ui, BundleTarget::Main] {
            graph.register(Task::new(
                bundle_task_id(target),
                [MANIFEST_TASK],
                Arc::new(BundleTask {
                    target,
                    staging_dir: self.staging_root.join(target.as_str()),
                    bundler: self.bundler.clone(),
                }),
            ))?;
        }
        graph.register(Task::new(
            PACKAGE_TASK,
            [MANIFEST_TASK, UI_BUNDLE_TASK, MAIN_BUNDLE_TASK],
            Arc::new(PackageTask {
                out_dir: self.out_dir.clone(),
            }),
        ))?;
        Ok(())
    }

    /// A fresh graph holding only the build tasks.
    pub fn graph(&self) -> Result<TaskGraph, GraphError> {
        let mut graph = TaskGraph::new();
        self.register(&mut graph)?;
        Ok(graph)
    }
}

struct ManifestTask {
    path: PathBuf,
}

#[async_trait]
impl TaskAction for ManifestTask {
    async fn run(&self, _ctx: TaskContext) -> Outcome {
        match load_manifest(&self.path) {
            Ok(artifact) => {
                debug!(name = %artifact.manifest.name, "manifest loaded");
                Outcome::with_artifact(&artifact)
            }
            Err(e) => Outcome::failure(FailureKind::InvalidManifest, e.to_string()),
        }
    }
}

struct BundleTask {
    target: BundleTarget,
    staging_dir: PathBuf,
    bundler: Arc<dyn Bundler>,
}

#[async_trait]
impl TaskAction for BundleTask {
    async fn run(&self, ctx: TaskContext) -> Outcome {
        let Some(manifest) = ctx.artifact::<ManifestArtifact>(MANIFEST_TASK) else {
            return Outcome::failure(FailureKind::Internal, "manifest artifact unavailable");
        };

        let entry = match self.target {
            BundleTarget::Main => manifest.main_entry,
            BundleTarget::Ui => match manifest.ui_entry {
                Some(entry) => entry,
                None => {
                    debug!("manifest declares no ui entry; nothing to bundle");
                    return Outcome::success();
                }
            },
        };

        let request = BundleRequest {
            target: self.target,
            entry,
            out_dir: self.staging_dir.clone(),
        };

        let result = tokio::select! {
            result = self.bundler.bundle(&request) => result,
            _ = ctx.cancel.cancelled() => {
                return Outcome::failure(FailureKind::Cancelled, "bundling interrupted");
            }
        };

        match result {
            Ok(artifact) => {
                info!(target_kind = %self.target, path = %artifact.path.display(), "bundle ready");
                Outcome::with_artifact(&artifact)
            }
            Err(e) => {
                let failure = Failure::new(FailureKind::BundleError, e.detail());
                if e.stderr.trim().is_empty() {
                    failure.into()
                } else {
                    failure.with_cause(e.message).into()
                }
            }
        }
    }
}

struct PackageTask {
    out_dir: PathBuf,
}

#[async_trait]
impl TaskAction for PackageTask {
    async fn run(&self, ctx: TaskContext) -> Outcome {
        let manifest = ctx.artifact::<ManifestArtifact>(MANIFEST_TASK);
        let main = ctx.artifact::<BundleArtifact>(MAIN_BUNDLE_TASK);
        let ui = ctx.artifact::<BundleArtifact>(UI_BUNDLE_TASK);

        match package::assemble(&self.out_dir, manifest.as_ref(), main.as_ref(), ui.as_ref()) {
            Ok(artifact) => {
                info!(out_dir = %artifact.out_dir.display(), "package assembled");
                Outcome::with_artifact(&artifact)
            }
            Err(e) => Outcome::failure(FailureKind::PackagingError, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{GraphRunner, RunnerConfig};
    use std::path::Path;
    use std::sync::Mutex;

    /// Writes `{target}.js` into the staging dir, or fails for the listed targets.
    struct FakeBundler {
        fail: Vec<BundleTarget>,
        calls: Mutex<Vec<BundleTarget>>,
    }

    impl FakeBundler {
        fn new(fail: Vec<BundleTarget>) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Bundler for FakeBundler {
        async fn bundle(&self, request: &BundleRequest) -> Result<BundleArtifact, BundleError> {
            self.calls.lock().unwrap().push(request.target);
            if self.fail.contains(&request.target) {
                return Err(BundleError::new("Bundler exited with code 1", "syntax error"));
            }
            std::fs::create_dir_all(&request.out_dir).unwrap();
            let path = request.out_dir.join(format!("{}.js", request.target));
            std::fs::write(&path, "bundle").unwrap();
            Ok(BundleArtifact {
                target: request.target,
                hash: bundler::hash_file(&path).unwrap(),
                path,
            })
        }
    }

    fn project(with_ui: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let manifest = if with_ui {
            r#"{"name":"Picker","id":"1","api":"1.0","main":"code.ts","ui":"ui.html"}"#
        } else {
            r#"{"name":"Picker","id":"1","api":"1.0","main":"code.ts"}"#
        };
        std::fs::write(dir.path().join("manifest.json"), manifest).unwrap();
        std::fs::write(dir.path().join("code.ts"), "export {}").unwrap();
        std::fs::write(dir.path().join("ui.html"), "<div></div>").unwrap();
        dir
    }

    fn pipeline(dir: &Path, bundler: Arc<dyn Bundler>) -> BuildPipeline {
        BuildPipeline::new(
            dir.join("manifest.json"),
            dir.join("dist"),
            dir.join(".plugkit/staging"),
            bundler,
        )
    }

    #[tokio::test]
    async fn test_build_produces_canonical_package() {
        let dir = project(true);
        let graph = pipeline(dir.path(), FakeBundler::new(vec![])).graph().unwrap();

        let report = GraphRunner::new(RunnerConfig::default()).run(&graph, None).await;

        assert!(report.is_success(), "{:?}", report.failures().collect::<Vec<_>>());
        let pkg: PackageArtifact = report.outcome(PACKAGE_TASK).unwrap().artifact_as().unwrap();
        assert!(pkg.main.ends_with("dist/main.bundle.js"));
        assert!(pkg.ui.unwrap().ends_with("dist/ui.bundle.js"));
        assert!(dir.path().join("dist/manifest.json").is_file());
    }

    #[tokio::test]
    async fn test_ui_bundle_failure_spares_main_bundle() {
        let dir = project(true);
        let bundler = FakeBundler::new(vec![BundleTarget::Ui]);
        let graph = pipeline(dir.path(), bundler.clone()).graph().unwrap();

        let report = GraphRunner::new(RunnerConfig::default()).run(&graph, None).await;

        let ui = report.outcome(UI_BUNDLE_TASK).unwrap().as_failure().unwrap();
        assert_eq!(ui.kind, FailureKind::BundleError);
        assert_eq!(ui.message, "syntax error");
        assert!(report.outcome(MAIN_BUNDLE_TASK).unwrap().is_success());
        assert_eq!(
            report.outcome(PACKAGE_TASK).unwrap().failure_kind(),
            Some(FailureKind::DependencyFailed)
        );
        assert_eq!(report.root_cause().unwrap().id, UI_BUNDLE_TASK);
        assert_eq!(bundler.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_manifest_stops_everything() {
        let dir = project(true);
        std::fs::remove_file(dir.path().join("code.ts")).unwrap();
        let bundler = FakeBundler::new(vec![]);
        let graph = pipeline(dir.path(), bundler.clone()).graph().unwrap();

        let report = GraphRunner::new(RunnerConfig::default()).run(&graph, None).await;

        assert_eq!(
            report.outcome(MANIFEST_TASK).unwrap().failure_kind(),
            Some(FailureKind::InvalidManifest)
        );
        for id in [UI_BUNDLE_TASK, MAIN_BUNDLE_TASK, PACKAGE_TASK] {
            assert_eq!(
                report.outcome(id).unwrap().failure_kind(),
                Some(FailureKind::DependencyFailed)
            );
        }
        assert!(bundler.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manifest_without_ui_skips_ui_bundle() {
        let dir = project(false);
        let bundler = FakeBundler::new(vec![]);
        let graph = pipeline(dir.path(), bundler.clone()).graph().unwrap();

        let report = GraphRunner::new(RunnerConfig::default()).run(&graph, None).await;

        assert!(report.is_success());
        assert!(report.outcome(UI_BUNDLE_TASK).unwrap().artifact().is_none());
        assert_eq!(*bundler.calls.lock().unwrap(), vec![BundleTarget::Main]);
        let pkg = PackageArtifact::locate(&dir.path().join("dist")).unwrap();
        assert!(pkg.ui.is_none());
    }

    #[tokio::test]
    async fn test_incremental_rebuild_of_ui_only() {
        let dir = project(true);
        let bundler = FakeBundler::new(vec![]);
        let graph = pipeline(dir.path(), bundler.clone()).graph().unwrap();
        let mut runner = GraphRunner::new(RunnerConfig::default());

        runner.run(&graph, None).await;
        bundler.calls.lock().unwrap().clear();

        let report = runner
            .run(&graph, Some(&[UI_BUNDLE_TASK.to_string()]))
            .await;

        assert!(report.is_success());
        assert_eq!(*bundler.calls.lock().unwrap(), vec![BundleTarget::Ui]);
        assert!(report.entry(MAIN_BUNDLE_TASK).unwrap().reused);
        assert!(report.entry(PACKAGE_TASK).unwrap().executed);
    }

    #[test]
    fn test_task_ids() {
        let graph = pipeline(Path::new("/tmp/x"), FakeBundler::new(vec![]))
            .graph()
            .unwrap();
        assert_eq!(
            graph.ids(),
            vec![MANIFEST_TASK, UI_BUNDLE_TASK, MAIN_BUNDLE_TASK, PACKAGE_TASK]
        );
        assert_eq!(bundle_task_id(BundleTarget::Ui), UI_BUNDLE_TASK);
    }
}
