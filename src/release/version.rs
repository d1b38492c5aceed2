//! Semantic versions and the version file.

use crate::errors::ReleaseError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("Invalid bump kind '{0}' (expected patch, minor or major)")]
    InvalidBumpKind(String),

    #[error("Invalid version '{0}' (expected MAJOR.MINOR.PATCH)")]
    InvalidVersion(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpKind {
    Patch,
    Minor,
    Major,
}

impl FromStr for BumpKind {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patch" => Ok(Self::Patch),
            "minor" => Ok(Self::Minor),
            "major" => Ok(Self::Major),
            _ => Err(VersionError::InvalidBumpKind(s.to_string())),
        }
    }
}

impl std::fmt::Display for BumpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Patch => write!(f, "patch"),
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
        }
    }
}

/// `MAJOR.MINOR.PATCH[-pre]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Next version. Lower components reset and any pre-release tag is dropped.
    pub fn bump(&self, kind: BumpKind) -> Self {
        match kind {
            BumpKind::Patch => Self::new(self.major, self.minor, self.patch + 1),
            BumpKind::Minor => Self::new(self.major, self.minor + 1, 0),
            BumpKind::Major => Self::new(self.major + 1, 0, 0),
        }
    }

    /// Tag name for this version.
    pub fn tag(&self) -> String {
        format!("v{}", self)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VersionError::InvalidVersion(s.to_string());
        let trimmed = s.trim().trim_start_matches('v');
        let (core, pre) = match trimmed.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (trimmed, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(invalid());
        };
        let parse = |p: &str| p.parse::<u64>().map_err(|_| invalid());

        Ok(Self {
            major: parse(*major)?,
            minor: parse(*minor)?,
            patch: parse(*patch)?,
            pre,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

static VERSION_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""version"\s*:\s*"([^"]*)""#).unwrap());

/// A JSON file with a top-level `"version"` string, edited in place.
#[derive(Debug, Clone)]
pub struct VersionFile {
    path: PathBuf,
}

impl VersionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, message: impl Into<String>) -> ReleaseError {
        ReleaseError::VersionFile {
            path: self.path.clone(),
            message: message.into(),
        }
    }

    fn content(&self) -> Result<String, ReleaseError> {
        std::fs::read_to_string(&self.path).map_err(|e| self.error(e.to_string()))
    }

    pub fn read(&self) -> Result<Version, ReleaseError> {
        let content = self.content()?;
        let captures = VERSION_FIELD
            .captures(&content)
            .ok_or_else(|| self.error("no \"version\" field"))?;
        captures[1].parse().map_err(|e: VersionError| self.error(e.to_string()))
    }

    /// Replace the first `"version"` value, keeping the rest of the file
    /// byte-for-byte.
    pub fn write(&self, version: &Version) -> Result<(), ReleaseError> {
        let content = self.content()?;
        if !VERSION_FIELD.is_match(&content) {
            return Err(self.error("no \"version\" field"));
        }
        let replacement = format!(r#""version": "{}""#, version);
        let updated = VERSION_FIELD.replacen(&content, 1, regex::NoExpand(&replacement));
        std::fs::write(&self.path, updated.as_bytes()).map_err(|e| self.error(e.to_string()))
    }

    /// Compute the bumped version and, unless `dry_run`, write it.
    /// Returns `(previous, next)`.
    pub fn bump(&self, kind: BumpKind, dry_run: bool) -> Result<(Version, Version), ReleaseError> {
        let current = self.read()?;
        let next = current.bump(kind);
        if !dry_run {
            self.write(&next)?;
        }
        Ok((current, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_and_display() {
        let v: Version = "1.2.3".parse().unwrap();
        assert_eq!(v, Version::new(1, 2, 3));
        let v: Version = "v2.0.0-beta.1".parse().unwrap();
        assert_eq!(v.pre.as_deref(), Some("beta.1"));
        assert_eq!(v.to_string(), "2.0.0-beta.1");
        assert_eq!(v.tag(), "v2.0.0-beta.1");

        for bad in ["1.2", "1.2.x", "1.2.3.4", "", "1.2.3-"] {
            assert!(bad.parse::<Version>().is_err(), "{bad} parsed");
        }
    }

    #[test]
    fn test_bump_resets_lower_components() {
        let v: Version = "1.4.7-rc.2".parse().unwrap();
        assert_eq!(v.bump(BumpKind::Patch).to_string(), "1.4.8");
        assert_eq!(v.bump(BumpKind::Minor).to_string(), "1.5.0");
        assert_eq!(v.bump(BumpKind::Major).to_string(), "2.0.0");
    }

    #[test]
    fn test_bump_kind_from_str() {
        assert_eq!("Minor".parse::<BumpKind>().unwrap(), BumpKind::Minor);
        assert_eq!(
            "huge".parse::<BumpKind>().unwrap_err(),
            VersionError::InvalidBumpKind("huge".into())
        );
    }

    #[test]
    fn test_version_file_rewrite_preserves_formatting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("package.json");
        let original = "{\n    \"name\": \"picker\",\n    \"version\":  \"0.3.9\",\n    \"dependencies\": {\"x\": {\"version\": \"9.9.9\"}}\n}\n";
        std::fs::write(&path, original).unwrap();

        let file = VersionFile::new(&path);
        let (from, to) = file.bump(BumpKind::Minor, false).unwrap();
        assert_eq!(from.to_string(), "0.3.9");
        assert_eq!(to.to_string(), "0.4.0");

        let updated = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            updated,
            "{\n    \"name\": \"picker\",\n    \"version\": \"0.4.0\",\n    \"dependencies\": {\"x\": {\"version\": \"9.9.9\"}}\n}\n"
        );
    }

    #[test]
    fn test_dry_run_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(&path, r#"{"version": "1.0.0"}"#).unwrap();

        let (_, next) = VersionFile::new(&path).bump(BumpKind::Major, true).unwrap();
        assert_eq!(next.to_string(), "2.0.0");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"version": "1.0.0"}"#);
    }

    #[test]
    fn test_version_file_errors() {
        let dir = tempdir().unwrap();
        let missing = VersionFile::new(dir.path().join("package.json"));
        assert!(matches!(missing.read(), Err(ReleaseError::VersionFile { .. })));

        let path = dir.path().join("no-version.json");
        std::fs::write(&path, r#"{"name": "x"}"#).unwrap();
        let err = VersionFile::new(&path).read().unwrap_err();
        assert!(err.to_string().contains("no \"version\" field"));
    }
}
