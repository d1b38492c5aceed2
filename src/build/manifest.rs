//! Plugin manifest loading and normalization.
//!
//! The source descriptor is a `manifest.json` next to the plugin sources:
//!
//! ```json
//! {
//!   "name": "Color Picker",
//!   "id": "1234567890",
//!   "api": "1.0",
//!   "main": "src/main.ts",
//!   "ui": "src/ui.html",
//!   "editorType": ["design"]
//! }
//! ```
//!
//! Unknown fields pass through unchanged into the packaged manifest.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fields that must be present and non-empty.
pub const REQUIRED_FIELDS: [&str; 4] = ["name", "id", "api", "main"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest {path} is not valid JSON: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Manifest is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Manifest field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Entry point '{field}' does not exist: {path}")]
    MissingEntry { field: &'static str, path: PathBuf },
}

/// Parsed plugin metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub id: String,
    pub api: String,
    pub main: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Output of the manifest task: the manifest plus resolved entry points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestArtifact {
    pub manifest: PluginManifest,
    /// Directory the manifest was read from; entry points resolve against it
    pub source_dir: PathBuf,
    pub main_entry: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_entry: Option<PathBuf>,
}

impl PluginManifest {
    /// Parse manifest JSON, checking required fields.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ManifestError> {
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| ManifestError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let object = value.as_object().ok_or_else(|| ManifestError::Parse {
            path: path.to_path_buf(),
            message: "expected a JSON object".to_string(),
        })?;

        for field in REQUIRED_FIELDS {
            match object.get(field) {
                None | Some(serde_json::Value::Null) => {
                    return Err(ManifestError::MissingField(field));
                }
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                    return Err(ManifestError::InvalidField {
                        field,
                        reason: "must not be empty".to_string(),
                    });
                }
                Some(serde_json::Value::String(_)) => {}
                Some(_) => {
                    return Err(ManifestError::InvalidField {
                        field,
                        reason: "must be a string".to_string(),
                    });
                }
            }
        }

        let manifest: Self =
            serde_json::from_value(value.clone()).map_err(|e| ManifestError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if !is_api_version(&manifest.api) {
            return Err(ManifestError::InvalidField {
                field: "api",
                reason: format!("'{}' is not a MAJOR.MINOR version", manifest.api),
            });
        }

        Ok(manifest)
    }

    /// The same manifest with entry points rewritten to packaged file names.
    pub fn normalized(&self, main_file: &str, ui_file: Option<&str>) -> Self {
        Self {
            main: main_file.to_string(),
            ui: ui_file.map(String::from),
            ..self.clone()
        }
    }
}

fn is_api_version(api: &str) -> bool {
    let mut parts = api.split('.');
    let (Some(major), Some(minor), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    [major, minor]
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Read and validate the manifest at `path`, checking that entry points exist.
pub fn load_manifest(path: &Path) -> Result<ManifestArtifact, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let manifest = PluginManifest::parse(&content, path)?;

    let source_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let main_entry = source_dir.join(&manifest.main);
    if !main_entry.is_file() {
        return Err(ManifestError::MissingEntry {
            field: "main",
            path: main_entry,
        });
    }

    let ui_entry = match &manifest.ui {
        Some(ui) => {
            let entry = source_dir.join(ui);
            if !entry.is_file() {
                return Err(ManifestError::MissingEntry {
                    field: "ui",
                    path: entry,
                });
            }
            Some(entry)
        }
        None => None,
    };

    Ok(ManifestArtifact {
        manifest,
        source_dir,
        main_entry,
        ui_entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"{
        "name": "Color Picker",
        "id": "1234",
        "api": "1.0",
        "main": "src/main.ts",
        "ui": "src/ui.html",
        "editorType": ["design"]
    }"#;

    fn write_project(manifest: &str, files: &[&str]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), manifest).unwrap();
        for file in files {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "// entry").unwrap();
        }
        dir
    }

    #[test]
    fn test_load_valid_manifest() {
        let dir = write_project(MANIFEST, &["src/main.ts", "src/ui.html"]);
        let artifact = load_manifest(&dir.path().join("manifest.json")).unwrap();

        assert_eq!(artifact.manifest.name, "Color Picker");
        assert!(artifact.main_entry.ends_with("src/main.ts"));
        assert!(artifact.ui_entry.unwrap().ends_with("src/ui.html"));
        assert_eq!(
            artifact.manifest.extra.get("editorType"),
            Some(&serde_json::json!(["design"]))
        );
    }

    #[test]
    fn test_ui_is_optional() {
        let manifest = r#"{"name": "n", "id": "1", "api": "1.0", "main": "code.js"}"#;
        let dir = write_project(manifest, &["code.js"]);
        let artifact = load_manifest(&dir.path().join("manifest.json")).unwrap();
        assert!(artifact.ui_entry.is_none());
    }

    #[test]
    fn test_missing_required_field() {
        let manifest = r#"{"name": "n", "api": "1.0", "main": "code.js"}"#;
        let dir = write_project(manifest, &["code.js"]);
        let err = load_manifest(&dir.path().join("manifest.json")).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField("id")));
    }

    #[test]
    fn test_empty_id_and_bad_api() {
        let path = Path::new("manifest.json");
        let err =
            PluginManifest::parse(r#"{"name":"n","id":" ","api":"1.0","main":"m"}"#, path)
                .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidField { field: "id", .. }));

        let err =
            PluginManifest::parse(r#"{"name":"n","id":"1","api":"v1","main":"m"}"#, path)
                .unwrap_err();
        assert!(matches!(err, ManifestError::InvalidField { field: "api", .. }));
    }

    #[test]
    fn test_missing_entry_file() {
        let dir = write_project(MANIFEST, &["src/main.ts"]);
        let err = load_manifest(&dir.path().join("manifest.json")).unwrap_err();
        match err {
            ManifestError::MissingEntry { field, path } => {
                assert_eq!(field, "ui");
                assert!(path.ends_with("src/ui.html"));
            }
            other => panic!("Expected MissingEntry, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_manifest_file() {
        let dir = tempdir().unwrap();
        let err = load_manifest(&dir.path().join("manifest.json")).unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
    }

    #[test]
    fn test_normalized_rewrites_entries_and_keeps_extras() {
        let manifest = PluginManifest::parse(MANIFEST, Path::new("manifest.json")).unwrap();
        let normalized = manifest.normalized("main.bundle.js", None);

        assert_eq!(normalized.main, "main.bundle.js");
        assert_eq!(normalized.ui, None);
        assert_eq!(normalized.extra, manifest.extra);

        let json = serde_json::to_value(&normalized).unwrap();
        assert_eq!(json["editorType"], serde_json::json!(["design"]));
        assert!(json.get("ui").is_none());
    }

    #[test]
    fn test_api_version_shape() {
        assert!(is_api_version("1.0"));
        assert!(is_api_version("12.34"));
        assert!(!is_api_version("1"));
        assert!(!is_api_version("1.0.0"));
        assert!(!is_api_version("1.x"));
    }
}
