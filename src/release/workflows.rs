//! CI workflow templates.
//!
//! Templates are embedded at build time and rendered with three
//! placeholders: `{{plugin_name}}`, `{{version}}` and `{{node_version}}`.

use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/templates/workflows/"]
struct Templates;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Template {name} is missing from the binary")]
    Missing { name: String },

    #[error("Rendered {name} is not valid YAML: {message}")]
    InvalidYaml { name: String, message: String },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    pub plugin_name: String,
    pub version: String,
    pub node_version: String,
}

impl TemplateVars {
    fn render(&self, template: &str) -> String {
        template
            .replace("{{plugin_name}}", &self.plugin_name)
            .replace("{{version}}", &self.version)
            .replace("{{node_version}}", &self.node_version)
    }
}

/// One workflow file after a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedWorkflow {
    pub path: PathBuf,
    /// Content differed from what was on disk
    pub changed: bool,
}

/// Names of the embedded templates, sorted.
pub fn template_names() -> Vec<String> {
    let mut names: Vec<String> = Templates::iter().map(|name| name.to_string()).collect();
    names.sort();
    names
}

/// Render one embedded template and check that it parses as YAML.
pub fn render(name: &str, vars: &TemplateVars) -> Result<String, WorkflowError> {
    let file = Templates::get(name).ok_or_else(|| WorkflowError::Missing {
        name: name.to_string(),
    })?;
    let rendered = vars.render(&String::from_utf8_lossy(&file.data));
    serde_yaml::from_str::<serde_yaml::Value>(&rendered).map_err(|e| WorkflowError::InvalidYaml {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    Ok(rendered)
}

/// Bring `dir` in line with the rendered templates. Files are only written
/// when their content differs, and never when `dry_run` is set.
pub fn sync(dir: &Path, vars: &TemplateVars, dry_run: bool) -> Result<Vec<SyncedWorkflow>, WorkflowError> {
    let mut rendered = Vec::new();
    for name in template_names() {
        let content = render(&name, vars)?;
        rendered.push((dir.join(&name), content));
    }

    if !dry_run {
        std::fs::create_dir_all(dir).map_err(|source| WorkflowError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let mut synced = Vec::new();
    for (path, content) in rendered {
        let changed = std::fs::read_to_string(&path).map_or(true, |existing| existing != content);
        if changed && !dry_run {
            std::fs::write(&path, &content).map_err(|source| WorkflowError::Write {
                path: path.clone(),
                source,
            })?;
        }
        synced.push(SyncedWorkflow { path, changed });
    }
    Ok(synced)
}
