//! `package.json` handling that touches only the dependency tables.
//!
//! Unknown fields and key order survive a load/save cycle.

use anyhow::Context;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::write_atomic;

pub const MANIFEST_FILE: &str = "package.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencySection {
    Dependencies,
    DevDependencies,
}

impl DependencySection {
    pub fn key(&self) -> &'static str {
        match self {
            DependencySection::Dependencies => "dependencies",
            DependencySection::DevDependencies => "devDependencies",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageManifest {
    root: Map<String, Value>,
}

impl PackageManifest {
    pub fn path_in(project: &Path) -> PathBuf {
        project.join(MANIFEST_FILE)
    }

    /// Load the manifest of `project`. A missing file is an empty manifest; a file that
    /// is not a JSON object is an error so it never gets overwritten.
    pub fn load(project: &Path) -> anyhow::Result<Self> {
        let path = Self::path_in(project);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Self::parse(&content).with_context(|| format!("Malformed manifest {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        match serde_json::from_str::<Value>(content)? {
            Value::Object(root) => Ok(Self { root }),
            other => anyhow::bail!("expected a JSON object, found {}", json_kind(&other)),
        }
    }

    pub fn save(&self, project: &Path) -> anyhow::Result<()> {
        let path = Self::path_in(project);
        let mut content = serde_json::to_string_pretty(&Value::Object(self.root.clone()))?;
        content.push('\n');
        write_atomic(&path, &content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// True if `name` is declared in either dependency table.
    pub fn has(&self, name: &str) -> bool {
        [DependencySection::Dependencies, DependencySection::DevDependencies]
            .iter()
            .any(|section| self.version_of(*section, name).is_some())
    }

    pub fn version_of(&self, section: DependencySection, name: &str) -> Option<&str> {
        self.root
            .get(section.key())
            .and_then(Value::as_object)
            .and_then(|table| table.get(name))
            .and_then(Value::as_str)
    }

    /// Insert `name` into `section`, creating the table if needed. A non-object table
    /// is replaced.
    pub fn add(&mut self, section: DependencySection, name: &str, version: &str) {
        let table = self
            .root
            .entry(section.key())
            .or_insert_with(|| Value::Object(Map::new()));
        if !table.is_object() {
            tracing::warn!(section = section.key(), "replacing non-object dependency table");
            *table = Value::Object(Map::new());
        }
        if let Value::Object(map) = table {
            map.insert(name.to_string(), Value::String(version.to_string()));
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = PackageManifest::load(dir.path()).unwrap();
        assert!(!manifest.has("react"));
    }

    #[test]
    fn test_malformed_manifest_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "{ \"name\": ").unwrap();
        assert!(PackageManifest::load(dir.path()).is_err());
        fs::write(dir.path().join(MANIFEST_FILE), "[1, 2]").unwrap();
        assert!(PackageManifest::load(dir.path()).is_err());
    }

    #[test]
    fn test_save_preserves_unknown_fields_and_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"name":"demo","scripts":{"build":"next build"},"dependencies":{"react":"^18.3.1"}}"#,
        )
        .unwrap();
        let mut manifest = PackageManifest::load(dir.path()).unwrap();
        assert!(manifest.has("react"));
        manifest.add(DependencySection::Dependencies, "clsx", "^2.1.0");
        manifest.add(DependencySection::DevDependencies, "typescript", "^5.7.3");
        manifest.save(dir.path()).unwrap();

        let written = fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        assert!(written.ends_with('\n'));
        let name_at = written.find("\"name\"").unwrap();
        let scripts_at = written.find("\"scripts\"").unwrap();
        let deps_at = written.find("\"dependencies\"").unwrap();
        let dev_at = written.find("\"devDependencies\"").unwrap();
        assert!(name_at < scripts_at && scripts_at < deps_at && deps_at < dev_at);

        let reloaded = PackageManifest::load(dir.path()).unwrap();
        assert_eq!(
            reloaded.version_of(DependencySection::Dependencies, "clsx"),
            Some("^2.1.0")
        );
        assert!(reloaded.has("typescript"));
    }
}
