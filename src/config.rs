//! Configuration for plugkit.
//!
//! Settings are read from `plugkit.toml` at the project root and layered:
//! built-in defaults, then the file, then `PLUGKIT_*` environment variables,
//! then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "color-picker"
//! manifest = "manifest.json"
//! out_dir = "dist"
//!
//! [build]
//! bundler = "npx vite build"
//! max_parallel = 4
//!
//! [launch]
//! room = "auto"
//! host_command = "design-host --plugin-runtime"
//! handshake_timeout_ms = 5000
//!
//! [release]
//! version_file = "package.json"
//! remote = "origin"
//!
//! [[tests.assertions]]
//! name = "renders-swatches"
//! payload = { count = 12 }
//! ```

use crate::dag::RunnerConfig;
use crate::room::RoomPreference;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the project config file.
pub const CONFIG_FILE: &str = "plugkit.toml";

/// Starter config written by `plugkit config init`.
pub const DEFAULT_CONFIG: &str = r##"# plugkit configuration

[project]
manifest = "manifest.json"
out_dir = "dist"

[build]
bundler = "npx vite build"
max_parallel = 4

[launch]
room = "auto"
# host_command = "design-host --plugin-runtime"
handshake_timeout_ms = 5000
assertion_timeout_ms = 10000

[release]
version_file = "package.json"
workflows_dir = ".github/workflows"
remote = "origin"

# [[tests.assertions]]
# name = "renders"
# payload = { selector = "#root" }
"##;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Plugin name; falls back to the manifest's `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_manifest() -> PathBuf {
    PathBuf::from("manifest.json")
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".plugkit")
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: None,
            manifest: default_manifest(),
            out_dir: default_out_dir(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    /// Bundler command line, run through `sh -c`
    #[serde(default = "default_bundler")]
    pub bundler: String,
    #[serde(default)]
    pub bundler_args: Vec<String>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_bundle_timeout")]
    pub bundle_timeout_secs: u64,
}

fn default_bundler() -> String {
    "npx vite build".to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_bundle_timeout() -> u64 {
    300
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            bundler: default_bundler(),
            bundler_args: Vec::new(),
            max_parallel: default_max_parallel(),
            bundle_timeout_secs: default_bundle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSection {
    #[serde(default)]
    pub room: RoomPreference,
    /// Command that starts the host runtime for the plugin room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_command: Option<String>,
    #[serde(default)]
    pub host_args: Vec<String>,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_assertion_timeout")]
    pub assertion_timeout_ms: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// 0 picks a free port
    #[serde(default)]
    pub browser_port: u16,
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_assertion_timeout() -> u64 {
    10_000
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_open_browser() -> bool {
    true
}

impl Default for LaunchSection {
    fn default() -> Self {
        Self {
            room: RoomPreference::Auto,
            host_command: None,
            host_args: Vec::new(),
            handshake_timeout_ms: default_handshake_timeout(),
            assertion_timeout_ms: default_assertion_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            browser_port: 0,
            open_browser: default_open_browser(),
        }
    }
}

impl LaunchSection {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn assertion_timeout(&self) -> Duration {
        Duration::from_millis(self.assertion_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSection {
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Branch to push; the current branch when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default = "default_node_version")]
    pub node_version: String,
}

fn default_version_file() -> PathBuf {
    PathBuf::from("package.json")
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from(".github/workflows")
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_node_version() -> String {
    "20".to_string()
}

impl Default for ReleaseSection {
    fn default() -> Self {
        Self {
            version_file: default_version_file(),
            workflows_dir: default_workflows_dir(),
            remote: default_remote(),
            branch: None,
            node_version: default_node_version(),
        }
    }
}

/// One remote assertion to run during `plugkit test`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionConfig {
    pub name: String,
    /// Opaque payload handed to the remote handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestsSection {
    #[serde(default)]
    pub assertions: Vec<AssertionConfig>,
}

/// The complete plugkit.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlugkitToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub launch: LaunchSection,
    #[serde(default)]
    pub release: ReleaseSection,
    #[serde(default)]
    pub tests: TestsSection,
}

impl PlugkitToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse plugkit.toml")
    }

    /// Load `plugkit.toml` from the project root, or defaults if it does not exist.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize plugkit.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PLUGKIT_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(room) = lookup("PLUGKIT_ROOM") {
            self.launch.room = room
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid PLUGKIT_ROOM")?;
        }
        if let Some(cmd) = lookup("PLUGKIT_HOST_COMMAND").filter(|c| !c.trim().is_empty()) {
            self.launch.host_command = Some(cmd);
        }
        if let Some(out_dir) = lookup("PLUGKIT_OUT_DIR").filter(|d| !d.trim().is_empty()) {
            self.project.out_dir = PathBuf::from(out_dir);
        }
        if let Some(bundler) = lookup("PLUGKIT_BUNDLER").filter(|b| !b.trim().is_empty()) {
            self.build.bundler = bundler;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.build.bundler.split_whitespace().next().is_none() {
            warnings.push("build.bundler is empty".to_string());
        }
        if self.build.max_parallel == 0 {
            warnings.push("build.max_parallel is 0; 1 will be used".to_string());
        }
        if self.launch.handshake_timeout_ms == 0 {
            warnings.push("launch.handshake_timeout_ms is 0; every launch will time out".to_string());
        }
        if self.launch.assertion_timeout_ms == 0 {
            warnings.push(
                "launch.assertion_timeout_ms is 0; every assertion will time out".to_string(),
            );
        }
        if self.launch.room == RoomPreference::Plugin && self.launch.host_command.is_none() {
            warnings.push("launch.room is 'plugin' but launch.host_command is not set".to_string());
        }
        if self.project.out_dir == self.project.state_dir {
            warnings.push("project.out_dir and project.state_dir must differ".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for assertion in &self.tests.assertions {
            if assertion.name.trim().is_empty() {
                warnings.push("tests.assertions entry with an empty name".to_string());
            } else if !seen.insert(assertion.name.as_str()) {
                warnings.push(format!("Duplicate assertion name '{}'", assertion.name));
            }
        }

        warnings
    }
}

/// Resolved configuration: plugkit.toml plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct PlugkitConfig {
    pub project_dir: PathBuf,
    pub toml: PlugkitToml,
    /// CLI override: verbose mode
    pub verbose: bool,
    /// CLI override: skip confirmation prompts
    pub yes: bool,
}

impl PlugkitConfig {
    /// Load configuration for a project directory, including environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_env(project_dir, |key| std::env::var(key).ok())
    }

    /// Load configuration with an injected environment lookup.
    pub fn with_env<F>(project_dir: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let mut toml = PlugkitToml::load_or_default(&project_dir)?;
        toml.apply_env(lookup)?;

        Ok(Self {
            project_dir,
            toml,
            verbose: false,
            yes: false,
        })
    }

    /// Create a config with CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, yes: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.yes = yes;
        Ok(config)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.project_dir.join(CONFIG_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.resolve(&self.toml.project.manifest)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.resolve(&self.toml.project.out_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.toml.project.state_dir)
    }

    /// Bundler working directory for one target (`ui` or `main`).
    pub fn staging_dir(&self, target: &str) -> PathBuf {
        self.state_dir().join("staging").join(target)
    }

    pub fn last_run_file(&self) -> PathBuf {
        self.state_dir().join("last-run.json")
    }

    pub fn release_lock_file(&self) -> PathBuf {
        self.state_dir().join("release.lock")
    }

    pub fn version_file(&self) -> PathBuf {
        self.resolve(&self.toml.release.version_file)
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.resolve(&self.toml.release.workflows_dir)
    }

    pub fn bundle_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.build.bundle_timeout_secs)
    }

    /// Runner settings derived from the build and launch sections.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_max_parallel(self.toml.build.max_parallel)
            .with_retry_backoff(self.toml.launch.retry_backoff())
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if !self.manifest_path().exists() {
            warnings.push(format!(
                "Manifest not found at {}",
                self.manifest_path().display()
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = PlugkitToml::parse("").unwrap();
        assert_eq!(toml.project.manifest, PathBuf::from("manifest.json"));
        assert_eq!(toml.project.out_dir, PathBuf::from("dist"));
        assert_eq!(toml.build.bundler, "npx vite build");
        assert_eq!(toml.build.max_parallel, 4);
        assert_eq!(toml.launch.room, RoomPreference::Auto);
        assert_eq!(toml.launch.handshake_timeout_ms, 5000);
        assert_eq!(toml.launch.assertion_timeout_ms, 10_000);
        assert!(toml.launch.open_browser);
        assert_eq!(toml.release.remote, "origin");
        assert_eq!(toml.release.node_version, "20");
        assert!(toml.tests.assertions.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let content = r##"
[project]
name = "color-picker"
out_dir = "build"

[build]
bundler = "node scripts/bundle.js"
bundler_args = ["--minify"]
max_parallel = 2

[launch]
room = "browser"
browser_port = 4173
open_browser = false

[release]
branch = "main"

[[tests.assertions]]
name = "renders"
payload = { selector = "#root", count = 3 }

[[tests.assertions]]
name = "closes"
"##;
        let toml = PlugkitToml::parse(content).unwrap();
        assert_eq!(toml.project.name.as_deref(), Some("color-picker"));
        assert_eq!(toml.project.out_dir, PathBuf::from("build"));
        assert_eq!(toml.build.bundler_args, vec!["--minify"]);
        assert_eq!(toml.launch.room, RoomPreference::Browser);
        assert_eq!(toml.launch.browser_port, 4173);
        assert_eq!(toml.release.branch.as_deref(), Some("main"));
        assert_eq!(toml.tests.assertions.len(), 2);
        assert_eq!(
            toml.tests.assertions[0].payload,
            Some(serde_json::json!({"selector": "#root", "count": 3}))
        );
        assert_eq!(toml.tests.assertions[1].payload, None);
    }

    #[test]
    fn test_parse_invalid_room() {
        let err = PlugkitToml::parse("[launch]\nroom = \"iframe\"\n").unwrap_err();
        assert!(err.to_string().contains("plugkit.toml"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = PlugkitToml::parse("[build]\nbundler = \"esbuild\"\n").unwrap();
        toml.apply_env(env(&[
            ("PLUGKIT_ROOM", "plugin"),
            ("PLUGKIT_HOST_COMMAND", "design-host"),
            ("PLUGKIT_OUT_DIR", "out"),
        ]))
        .unwrap();

        assert_eq!(toml.launch.room, RoomPreference::Plugin);
        assert_eq!(toml.launch.host_command.as_deref(), Some("design-host"));
        assert_eq!(toml.project.out_dir, PathBuf::from("out"));
        assert_eq!(toml.build.bundler, "esbuild");
    }

    #[test]
    fn test_env_rejects_invalid_room() {
        let mut toml = PlugkitToml::default();
        let err = toml.apply_env(env(&[("PLUGKIT_ROOM", "nowhere")])).unwrap_err();
        assert!(format!("{:#}", err).contains("PLUGKIT_ROOM"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut toml = PlugkitToml::default();
        assert!(toml.validate().is_empty());

        toml.launch.room = RoomPreference::Plugin;
        toml.build.max_parallel = 0;
        toml.tests.assertions = vec![
            AssertionConfig {
                name: "a".into(),
                payload: None,
            },
            AssertionConfig {
                name: "a".into(),
                payload: None,
            },
        ];
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("host_command")));
        assert!(warnings.iter().any(|w| w.contains("Duplicate assertion")));
    }

    #[test]
    fn test_default_config_parses() {
        let toml = PlugkitToml::parse(DEFAULT_CONFIG).unwrap();
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut toml = PlugkitToml::default();
        toml.project.name = Some("picker".to_string());
        toml.tests.assertions.push(AssertionConfig {
            name: "renders".into(),
            payload: Some(serde_json::json!({"n": 1})),
        });
        toml.save(&path).unwrap();

        let loaded = PlugkitToml::load(&path).unwrap();
        assert_eq!(loaded.project.name.as_deref(), Some("picker"));
        assert_eq!(loaded.tests.assertions, toml.tests.assertions);
    }

    #[test]
    fn test_config_paths() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[project]\nout_dir = \"build\"\n").unwrap();

        let config = PlugkitConfig::with_env(dir.path().to_path_buf(), env(&[])).unwrap();

        assert!(config.manifest_path().ends_with("manifest.json"));
        assert!(config.out_dir().ends_with("build"));
        assert!(config.last_run_file().ends_with(".plugkit/last-run.json"));
        assert!(config.staging_dir("ui").ends_with(".plugkit/staging/ui"));
        assert!(config.release_lock_file().ends_with(".plugkit/release.lock"));
        assert!(config.workflows_dir().ends_with(".github/workflows"));
        assert_eq!(config.runner_config().max_parallel, 4);
        assert!(
            config
                .validate()
                .iter()
                .any(|w| w.contains("Manifest not found"))
        );
    }

    #[test]
    fn test_missing_project_dir_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(PlugkitConfig::with_env(missing, env(&[])).is_err());
    }
}
