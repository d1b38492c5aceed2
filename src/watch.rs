//! File watching for `plugkit watch`.
//!
//! Filesystem events are debounced into batches and mapped onto build task
//! ids, which then drive an incremental graph run.

use crate::build::{MAIN_BUNDLE_TASK, MANIFEST_TASK, ManifestArtifact, UI_BUNDLE_TASK};
use crate::task::TaskId;
use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Quiet period that closes a batch of changes.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Directory names skipped wherever they appear.
const IGNORED_NAMES: [&str; 2] = [".git", "node_modules"];

/// Maps changed paths to the build tasks they invalidate.
#[derive(Debug, Clone)]
pub struct ChangeMapper {
    manifest_path: PathBuf,
    ui_dir: Option<PathBuf>,
    main_dir: Option<PathBuf>,
    ignored: Vec<PathBuf>,
}

impl ChangeMapper {
    /// `ignored` holds directories whose contents never trigger a rebuild
    /// (build output, state dir).
    pub fn new(manifest_path: impl Into<PathBuf>, ignored: Vec<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            ui_dir: None,
            main_dir: None,
            ignored,
        }
    }

    /// Learn the entry directories from the latest manifest.
    pub fn update_entries(&mut self, manifest: &ManifestArtifact) {
        self.main_dir = manifest.main_entry.parent().map(Path::to_path_buf);
        self.ui_dir = manifest
            .ui_entry
            .as_ref()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf);
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        path.components().any(|c| {
            IGNORED_NAMES
                .iter()
                .any(|name| c.as_os_str() == std::ffi::OsStr::new(name))
        }) || self.ignored.iter().any(|dir| path.starts_with(dir))
    }

    /// Task ids invalidated by `paths`, in pipeline order.
    pub fn task_ids(&self, paths: &[PathBuf]) -> Vec<TaskId> {
        let mut hit = BTreeSet::new();
        for path in paths.iter().filter(|p| !self.is_ignored(p)) {
            if *path == self.manifest_path {
                hit.insert(0);
                continue;
            }
            let under_ui = self.ui_dir.as_ref().is_some_and(|d| path.starts_with(d));
            let under_main = self.main_dir.as_ref().is_some_and(|d| path.starts_with(d));
            if under_ui {
                hit.insert(1);
            }
            if under_main {
                hit.insert(2);
            }
            if !under_ui && !under_main {
                hit.insert(1);
                hit.insert(2);
            }
        }
        hit.into_iter()
            .map(|i| [MANIFEST_TASK, UI_BUNDLE_TASK, MAIN_BUNDLE_TASK][i].to_string())
            .collect()
    }
}

/// Recursive watcher over the project directory.
pub struct ProjectWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl ProjectWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next debounced batch of changed paths. `None` when the
    /// watcher has shut down.
    pub async fn next_batch(&mut self, window: Duration) -> Option<Vec<PathBuf>> {
        debounce_batch(&mut self.rx, window).await
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Collect events until `window` passes without a new one.
pub async fn debounce_batch(
    rx: &mut mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    window: Duration,
) -> Option<Vec<PathBuf>> {
    let mut paths = BTreeSet::new();
    loop {
        let next = if paths.is_empty() {
            rx.recv().await
        } else {
            match tokio::time::timeout(window, rx.recv()).await {
                Ok(next) => next,
                Err(_) => break,
            }
        };

        match next {
            Some(Ok(event)) if is_change(&event.kind) => paths.extend(event.paths),
            Some(Ok(_)) => {}
            Some(Err(e)) => warn!(error = %e, "file watcher error"),
            None if paths.is_empty() => return None,
            None => break,
        }
    }
    debug!(count = paths.len(), "change batch");
    Some(paths.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::PluginManifest;
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    fn mapper() -> ChangeMapper {
        let mut mapper = ChangeMapper::new(
            "/proj/manifest.json",
            vec![PathBuf::from("/proj/dist"), PathBuf::from("/proj/.plugkit")],
        );
        mapper.update_entries(&ManifestArtifact {
            manifest: PluginManifest {
                name: "Picker".into(),
                id: "1".into(),
                api: "1.0".into(),
                main: "src/main/code.ts".into(),
                ui: Some("src/ui/index.html".into()),
                extra: Default::default(),
            },
            source_dir: "/proj".into(),
            main_entry: "/proj/src/main/code.ts".into(),
            ui_entry: Some("/proj/src/ui/index.html".into()),
        });
        mapper
    }

    fn ids(mapper: &ChangeMapper, paths: &[&str]) -> Vec<String> {
        let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
        mapper.task_ids(&paths)
    }

    #[test]
    fn test_manifest_change_maps_to_manifest() {
        assert_eq!(ids(&mapper(), &["/proj/manifest.json"]), vec!["manifest"]);
    }

    #[test]
    fn test_entry_directories_map_to_their_bundle() {
        let m = mapper();
        assert_eq!(ids(&m, &["/proj/src/ui/App.tsx"]), vec!["ui-bundle"]);
        assert_eq!(ids(&m, &["/proj/src/main/util.ts"]), vec!["main-bundle"]);
        assert_eq!(
            ids(&m, &["/proj/src/main/a.ts", "/proj/src/ui/b.css"]),
            vec!["ui-bundle", "main-bundle"]
        );
    }

    #[test]
    fn test_other_files_map_to_both_bundles() {
        assert_eq!(
            ids(&mapper(), &["/proj/src/shared/colors.ts"]),
            vec!["ui-bundle", "main-bundle"]
        );
    }

    #[test]
    fn test_ignored_paths_map_to_nothing() {
        let m = mapper();
        assert!(ids(&m, &["/proj/dist/main.bundle.js"]).is_empty());
        assert!(ids(&m, &["/proj/.plugkit/last-run.json"]).is_empty());
        assert!(ids(&m, &["/proj/.git/index"]).is_empty());
        assert!(ids(&m, &["/proj/node_modules/react/index.js"]).is_empty());
    }

    #[test]
    fn test_before_manifest_is_known_everything_rebuilds_bundles() {
        let m = ChangeMapper::new("/proj/manifest.json", vec![]);
        assert_eq!(ids(&m, &["/proj/src/ui/App.tsx"]), vec!["ui-bundle", "main-bundle"]);
    }

    fn event(kind: EventKind, path: &str) -> notify::Result<notify::Event> {
        Ok(notify::Event::new(kind).add_path(PathBuf::from(path)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_merges_burst() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(event(EventKind::Modify(ModifyKind::Any), "/proj/a.ts")).unwrap();
        tx.send(event(EventKind::Create(CreateKind::File), "/proj/b.ts")).unwrap();
        tx.send(event(EventKind::Modify(ModifyKind::Any), "/proj/a.ts")).unwrap();
        tx.send(event(EventKind::Access(AccessKind::Any), "/proj/c.ts")).unwrap();

        let batch = debounce_batch(&mut rx, DEBOUNCE).await.unwrap();
        assert_eq!(batch, vec![PathBuf::from("/proj/a.ts"), PathBuf::from("/proj/b.ts")]);

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send(event(EventKind::Remove(notify::event::RemoveKind::File), "/proj/d.ts"))
                .unwrap();
        });
        let next = debounce_batch(&mut rx, DEBOUNCE).await.unwrap();
        assert_eq!(next, vec![PathBuf::from("/proj/d.ts")]);
        late.await.unwrap();

        // Sender dropped with nothing pending
        assert!(debounce_batch(&mut rx, DEBOUNCE).await.is_none());
    }
}
