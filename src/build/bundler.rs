//! Bundler collaborator.
//!
//! Bundling is opaque: given an entry point and an output directory, the
//! bundler either produces one file (reported as path + SHA-256) or fails
//! with its stderr.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;
use walkdir::WalkDir;

/// Which entry point is being bundled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleTarget {
    Ui,
    Main,
}

impl BundleTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Main => "main",
        }
    }

    /// File stem of the packaged bundle (`ui.bundle`, `main.bundle`).
    pub fn packaged_stem(self) -> &'static str {
        match self {
            Self::Ui => "ui.bundle",
            Self::Main => "main.bundle",
        }
    }
}

impl std::fmt::Display for BundleTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to one bundler invocation.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub target: BundleTarget,
    pub entry: PathBuf,
    pub out_dir: PathBuf,
}

/// A bundled file and its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleArtifact {
    pub target: BundleTarget,
    pub path: PathBuf,
    /// SHA-256, lowercase hex
    pub hash: String,
}

/// A failed bundler invocation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BundleError {
    pub message: String,
    pub stderr: String,
}

impl BundleError {
    pub fn new(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stderr: stderr.into(),
        }
    }

    /// The most useful text to show: stderr if there is any, else the message.
    pub fn detail(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            &self.message
        } else {
            stderr
        }
    }
}

#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, request: &BundleRequest) -> Result<BundleArtifact, BundleError>;
}

/// Runs the configured bundler command through `sh -c`.
///
/// The command sees `PLUGKIT_ENTRY`, `PLUGKIT_OUT_DIR` and `PLUGKIT_TARGET`.
/// The bundle is the file named on the last line of stdout if there is one,
/// otherwise the newest file written into the output directory.
pub struct CommandBundler {
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandBundler {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    /// Build from the `[build]` section: `bundler` followed by `bundler_args`.
    pub fn from_config(config: &crate::config::PlugkitConfig) -> Self {
        let build = &config.toml.build;
        let mut command = build.bundler.clone();
        for arg in &build.bundler_args {
            command.push(' ');
            command.push_str(arg);
        }
        Self::new(command, config.project_dir.clone(), config.bundle_timeout())
    }

    fn locate_output(&self, stdout: &str, out_dir: &Path) -> Option<PathBuf> {
        if let Some(line) = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
            let candidate = PathBuf::from(line);
            let candidate = if candidate.is_absolute() {
                candidate
            } else {
                self.working_dir.join(candidate)
            };
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        newest_file(out_dir)
    }
}

#[async_trait]
impl Bundler for CommandBundler {
    async fn bundle(&self, request: &BundleRequest) -> Result<BundleArtifact, BundleError> {
        if request.out_dir.exists() {
            std::fs::remove_dir_all(&request.out_dir).map_err(|e| {
                BundleError::new(
                    format!("Failed to clear {}: {}", request.out_dir.display(), e),
                    "",
                )
            })?;
        }
        std::fs::create_dir_all(&request.out_dir).map_err(|e| {
            BundleError::new(
                format!("Failed to create {}: {}", request.out_dir.display(), e),
                "",
            )
        })?;

        debug!(target_kind = %request.target, command = %self.command, "running bundler");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PLUGKIT_ENTRY", &request.entry)
            .env("PLUGKIT_OUT_DIR", &request.out_dir)
            .env("PLUGKIT_TARGET", request.target.as_str())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BundleError::new(format!("Failed to spawn bundler '{}': {}", self.command, e), "")
            })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| BundleError::new(format!("Failed to wait for bundler: {}", e), ""))?,
            Err(_) => {
                return Err(BundleError::new(
                    format!("Bundler timed out after {} seconds", self.timeout.as_secs()),
                    "",
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(BundleError::new(
                format!(
                    "Bundler exited with code {}",
                    output.status.code().unwrap_or(-1)
                ),
                stderr.trim(),
            ));
        }

        let path = self.locate_output(&stdout, &request.out_dir).ok_or_else(|| {
            BundleError::new(
                format!("Bundler produced no output in {}", request.out_dir.display()),
                stderr.trim(),
            )
        })?;
        let hash = hash_file(&path)
            .map_err(|e| BundleError::new(format!("Failed to read {}: {}", path.display(), e), ""))?;

        Ok(BundleArtifact {
            target: request.target,
            path,
            hash,
        })
    }
}

/// SHA-256 of a file, lowercase hex.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn newest_file(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let modified = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.into_path())
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}
