//! Parser turning raw manifest files into a validated [`ManifestSet`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::resource::{ManifestSet, Resource, ResourceKind, Revision, API_VERSION};
use crate::source::error::{Result, SourceError};

/// One manifest file as read from a source at a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    /// Path relative to the source root.
    pub path: PathBuf,
    /// Raw file content.
    pub content: String,
}

impl ManifestFile {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Minimal header used to determine the kind before full parsing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceHeader {
    api_version: Option<String>,
    kind: Option<String>,
}

/// Returns true for paths that should be considered manifest files.
///
/// Only `.yaml`/`.yml` files count, and any hidden path component excludes
/// the file.
pub fn is_manifest_path(relative: &Path) -> bool {
    let has_hidden_component = relative.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    });
    if has_hidden_component {
        return false;
    }
    let ext = relative.extension().and_then(|e| e.to_str()).unwrap_or("");
    ext == "yaml" || ext == "yml"
}

/// Parses manifest files for one application.
pub struct ManifestParser {
    /// Namespace applied to resources that do not declare one.
    default_namespace: String,
}

impl ManifestParser {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
        }
    }

    /// Parses every file into one manifest set at `revision`.
    ///
    /// Any malformed document fails the whole set; there is no partial result.
    pub fn parse(&self, revision: &Revision, files: &[ManifestFile]) -> Result<ManifestSet> {
        let mut resources = Vec::new();
        let mut seen = BTreeSet::new();

        let mut ordered: Vec<&ManifestFile> = files.iter().collect();
        ordered.sort_by(|a, b| a.path.cmp(&b.path));

        for file in ordered {
            for resource in self.parse_file(revision, file)? {
                let reference = resource.reference();
                if !seen.insert(reference.clone()) {
                    return Err(invalid(
                        revision,
                        &file.path,
                        format!("duplicate resource {}", reference),
                    ));
                }
                resources.push(resource);
            }
        }

        Ok(ManifestSet::new(revision.clone(), resources))
    }

    /// Parses all YAML documents in one file.
    pub fn parse_file(&self, revision: &Revision, file: &ManifestFile) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&file.content) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| invalid(revision, &file.path, e.to_string()))?;
            if value.is_null() {
                // Empty document, e.g. a trailing `---`.
                continue;
            }
            resources.push(self.parse_document(revision, &file.path, value)?);
        }
        Ok(resources)
    }

    fn parse_document(
        &self,
        revision: &Revision,
        path: &Path,
        value: serde_yaml::Value,
    ) -> Result<Resource> {
        let header: ResourceHeader = serde_yaml::from_value(value.clone())
            .map_err(|e| invalid(revision, path, e.to_string()))?;

        let api_version = header
            .api_version
            .ok_or_else(|| invalid(revision, path, "missing apiVersion".to_string()))?;
        if api_version != API_VERSION {
            return Err(invalid(
                revision,
                path,
                format!(
                    "invalid apiVersion '{}', expected '{}'",
                    api_version, API_VERSION
                ),
            ));
        }

        let kind_name = header
            .kind
            .ok_or_else(|| invalid(revision, path, "missing kind".to_string()))?;
        let kind: ResourceKind = kind_name
            .parse()
            .map_err(|e: String| invalid(revision, path, e))?;

        // Normalize the kind spelling before the typed parse.
        let mut value = value;
        if let serde_yaml::Value::Mapping(map) = &mut value {
            map.insert(
                serde_yaml::Value::from("kind"),
                serde_yaml::Value::from(kind.to_string()),
            );
        }

        let mut resource: Resource =
            serde_yaml::from_value(value).map_err(|e| invalid(revision, path, e.to_string()))?;

        if resource.metadata.namespace.is_empty() {
            resource.metadata.namespace = self.default_namespace.clone();
        }
        validate_name(&resource.metadata.name)
            .and_then(|_| validate_name(&resource.metadata.namespace))
            .map_err(|e| invalid(revision, path, format!("{}: {}", resource.kind, e)))?;
        resource.validate_spec().map_err(|e| {
            invalid(
                revision,
                path,
                format!("{}: {}", resource.reference(), e),
            )
        })?;

        Ok(resource)
    }
}

/// Names and namespaces must be RFC-1123 labels.
fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("metadata.name is required".to_string());
    }
    if name.len() > 63 {
        return Err(format!("name '{}' is longer than 63 characters", name));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(format!(
            "name '{}' must consist of lowercase alphanumerics and '-'",
            name
        ));
    }
    Ok(())
}

fn invalid(revision: &Revision, path: &Path, message: String) -> SourceError {
    SourceError::ManifestInvalid {
        revision: revision.clone(),
        path: path.to_path_buf(),
        message,
    }
}
