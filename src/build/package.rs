//! Distributable layout.
//!
//! The package lives at stable paths so launch logic can find it without
//! asking the build pipeline:
//!
//! ```text
//! {out_dir}/manifest.json
//! {out_dir}/main.bundle.<ext>
//! {out_dir}/ui.bundle.<ext>     (only when the manifest declares a UI)
//! ```

use crate::build::bundler::{BundleArtifact, BundleTarget};
use crate::build::manifest::{ManifestArtifact, PluginManifest};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PACKAGED_MANIFEST: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Missing input artifact: {0}")]
    MissingInput(String),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No package found in {0}")]
    NotFound(PathBuf),

    #[error("Invalid packaged manifest: {0}")]
    InvalidManifest(String),
}

/// The packaged plugin on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageArtifact {
    pub out_dir: PathBuf,
    pub manifest: PathBuf,
    pub main: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<PathBuf>,
}

impl PackageArtifact {
    /// Rediscover a package from its canonical layout.
    pub fn locate(out_dir: &Path) -> Result<Self, PackageError> {
        let manifest = out_dir.join(PACKAGED_MANIFEST);
        if !manifest.is_file() {
            return Err(PackageError::NotFound(out_dir.to_path_buf()));
        }
        let main = find_bundle(out_dir, BundleTarget::Main)
            .ok_or_else(|| PackageError::NotFound(out_dir.to_path_buf()))?;
        let ui = find_bundle(out_dir, BundleTarget::Ui);

        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            manifest,
            main,
            ui,
        })
    }

    /// Read back the packaged manifest.
    pub fn read_manifest(&self) -> Result<PluginManifest, PackageError> {
        let content = std::fs::read_to_string(&self.manifest)
            .map_err(|e| PackageError::InvalidManifest(e.to_string()))?;
        PluginManifest::parse(&content, &self.manifest)
            .map_err(|e| PackageError::InvalidManifest(e.to_string()))
    }

    /// Path of a packaged file relative to the package root, with `/` separators.
    pub fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.out_dir)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

fn find_bundle(out_dir: &Path, target: BundleTarget) -> Option<PathBuf> {
    let pattern = out_dir.join(format!("{}.*", target.packaged_stem()));
    let mut matches: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

fn remove_stale(out_dir: &Path, target: BundleTarget) -> Result<(), PackageError> {
    let pattern = out_dir.join(format!("{}.*", target.packaged_stem()));
    let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
        return Ok(());
    };
    for path in paths.filter_map(|entry| entry.ok()) {
        std::fs::remove_file(&path).map_err(|source| PackageError::Write { path, source })?;
    }
    Ok(())
}

fn packaged_name(bundle: &BundleArtifact) -> String {
    let ext = bundle
        .path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("js");
    format!("{}.{}", bundle.target.packaged_stem(), ext)
}

fn copy_bundle(bundle: &BundleArtifact, out_dir: &Path) -> Result<PathBuf, PackageError> {
    if !bundle.path.is_file() {
        return Err(PackageError::MissingInput(format!(
            "{} bundle {}",
            bundle.target,
            bundle.path.display()
        )));
    }
    let dest = out_dir.join(packaged_name(bundle));
    std::fs::copy(&bundle.path, &dest).map_err(|source| PackageError::Write {
        path: dest.clone(),
        source,
    })?;
    Ok(dest)
}

/// Assemble the package from the manifest and bundle artifacts.
///
/// A UI bundle is required exactly when the manifest declares a UI entry.
pub fn assemble(
    out_dir: &Path,
    manifest: Option<&ManifestArtifact>,
    main: Option<&BundleArtifact>,
    ui: Option<&BundleArtifact>,
) -> Result<PackageArtifact, PackageError> {
    let manifest = manifest.ok_or_else(|| PackageError::MissingInput("manifest".into()))?;
    let main = main.ok_or_else(|| PackageError::MissingInput("main bundle".into()))?;
    if manifest.ui_entry.is_some() && ui.is_none() {
        return Err(PackageError::MissingInput(
            "ui bundle (the manifest declares a ui entry)".into(),
        ));
    }

    std::fs::create_dir_all(out_dir).map_err(|source| PackageError::Write {
        path: out_dir.to_path_buf(),
        source,
    })?;
    remove_stale(out_dir, BundleTarget::Main)?;
    remove_stale(out_dir, BundleTarget::Ui)?;

    let main_path = copy_bundle(main, out_dir)?;
    let ui_path = match ui {
        Some(ui) => Some(copy_bundle(ui, out_dir)?),
        None => None,
    };

    let normalized = manifest
        .manifest
        .normalized(&packaged_name(main), ui.map(packaged_name).as_deref());
    let manifest_path = out_dir.join(PACKAGED_MANIFEST);
    let json = serde_json::to_string_pretty(&normalized)
        .map_err(|e| PackageError::InvalidManifest(e.to_string()))?;
    std::fs::write(&manifest_path, json).map_err(|source| PackageError::Write {
        path: manifest_path.clone(),
        source,
    })?;

    Ok(PackageArtifact {
        out_dir: out_dir.to_path_buf(),
        manifest: manifest_path,
        main: main_path,
        ui: ui_path,
    })
}
