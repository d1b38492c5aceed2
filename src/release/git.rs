//! Git collaborator for the release pipeline.

use crate::errors::ReleaseError;
use crate::release::version::Version;
use async_trait::async_trait;
use git2::{Repository, Signature, Status, StatusOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub clean: bool,
    /// Paths with uncommitted changes, relative to the repository root
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dirty: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[async_trait]
pub trait GitCollaborator: Send + Sync {
    async fn status(&self) -> Result<GitStatus, ReleaseError>;

    /// Stage `paths`, commit them as the release of `version` and tag the
    /// commit. Returns the commit id.
    async fn commit_release(&self, version: &Version, paths: &[PathBuf]) -> Result<String, ReleaseError>;

    async fn push(&self) -> Result<PushResult, ReleaseError>;
}

/// Local operations through libgit2; push through the `git` CLI so the
/// user's credential helpers apply.
pub struct Git2Collaborator {
    repo_dir: PathBuf,
    remote: String,
    branch: Option<String>,
    /// Repository-relative prefixes left out of the status check
    ignored: Vec<String>,
}

impl Git2Collaborator {
    pub fn new(repo_dir: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            remote: remote.into(),
            branch: None,
            ignored: Vec::new(),
        }
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    /// Leave a directory out of the status check (build output, state dir).
    pub fn ignoring(mut self, path: &Path) -> Self {
        let relative = path.strip_prefix(&self.repo_dir).unwrap_or(path);
        let mut prefix = relative.to_string_lossy().replace('\\', "/");
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        if !prefix.is_empty() && !prefix.starts_with('/') {
            self.ignored.push(prefix);
        }
        self
    }

    fn open(&self) -> Result<Repository, ReleaseError> {
        Repository::open(&self.repo_dir).map_err(|e| {
            ReleaseError::Git(format!(
                "Failed to open git repository at {}: {}",
                self.repo_dir.display(),
                e.message()
            ))
        })
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignored
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()) || format!("{}/", path) == *prefix)
    }

    fn relative_to_workdir(&self, repo: &Repository, path: &Path) -> PathBuf {
        let workdir = repo.workdir().unwrap_or(self.repo_dir.as_path());
        path.strip_prefix(workdir)
            .or_else(|_| path.strip_prefix(&self.repo_dir))
            .unwrap_or(path)
            .to_path_buf()
    }
}

#[async_trait]
impl GitCollaborator for Git2Collaborator {
    async fn status(&self) -> Result<GitStatus, ReleaseError> {
        let repo = self.open()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let statuses = repo.statuses(Some(&mut opts))?;
        let dirty: Vec<String> = statuses
            .iter()
            .filter(|entry| entry.status() != Status::CURRENT && !entry.status().is_ignored())
            .filter_map(|entry| entry.path().map(String::from))
            .filter(|path| !self.is_ignored(path))
            .collect();

        debug!(dirty = dirty.len(), "git status");
        Ok(GitStatus {
            clean: dirty.is_empty(),
            dirty,
        })
    }

    async fn commit_release(&self, version: &Version, paths: &[PathBuf]) -> Result<String, ReleaseError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        for path in paths {
            let relative = self.relative_to_workdir(&repo, path);
            if self.repo_dir.join(&relative).exists() {
                index.add_path(&relative)?;
            }
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("plugkit", "plugkit@localhost"))?;
        let message = format!("Release {}", version.tag());

        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &parents)?;

        let target = repo.find_object(commit_id, None)?;
        repo.tag(&version.tag(), &target, &sig, &message, false)?;

        info!(commit = %commit_id, tag = %version.tag(), "release committed");
        Ok(commit_id.to_string())
    }

    async fn push(&self) -> Result<PushResult, ReleaseError> {
        let mut cmd = Command::new("git");
        cmd.arg("push").arg("--follow-tags").arg(&self.remote);
        if let Some(branch) = &self.branch {
            cmd.arg(branch);
        }
        let output = cmd
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|e| ReleaseError::Git(format!("Failed to run git push: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        classify_push(output.status.success(), &format!("{}{}", stdout, stderr))
    }
}

/// Interpret `git push` output.
pub(crate) fn classify_push(success: bool, output: &str) -> Result<PushResult, ReleaseError> {
    if success {
        return Ok(PushResult {
            accepted: true,
            reason: None,
        });
    }
    let rejection = output
        .lines()
        .map(str::trim)
        .find(|line| line.contains("rejected") || line.contains("non-fast-forward"));
    match rejection {
        Some(line) => Ok(PushResult {
            accepted: false,
            reason: Some(line.to_string()),
        }),
        None => Err(ReleaseError::Git(format!("git push failed: {}", output.trim()))),
    }
}
