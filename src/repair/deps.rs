//! Add third-party packages that source files import but the manifest never declares.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{PackageConfig, TreeConfig};
use crate::project::manifest::{DependencySection, PackageManifest};
use crate::project::source_files;
use crate::util::cached_regex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedPackage {
    pub name: String,
    pub version: String,
    pub dev: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub added: Vec<AddedPackage>,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        !self.added.is_empty()
    }
}

/// Installable package name for an import specifier: `@scope/name` for scoped packages,
/// the first path segment otherwise. `None` unless the result is a valid npm name.
pub fn base_package_name(specifier: &str) -> Option<&str> {
    let specifier = specifier.trim();
    if specifier.is_empty() || specifier.chars().any(char::is_whitespace) {
        return None;
    }
    let end = if specifier.starts_with('@') {
        let mut slashes = specifier.match_indices('/').map(|(i, _)| i);
        let first = slashes.next()?;
        if first <= 1 {
            return None;
        }
        slashes.next().unwrap_or(specifier.len())
    } else {
        specifier.find('/').unwrap_or(specifier.len())
    };
    let base = &specifier[..end];
    if is_valid_package_name(base) {
        Some(base)
    } else {
        None
    }
}

const MAX_PACKAGE_NAME_LEN: usize = 214;

/// npm registry rules: lowercase URL-safe characters, no leading `.` or `_`.
fn is_valid_package_name(name: &str) -> bool {
    fn valid_part(part: &str) -> bool {
        !part.is_empty()
            && !part.starts_with('.')
            && !part.starts_with('_')
            && part.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '.' | '_' | '~')
            })
    }

    if name.len() > MAX_PACKAGE_NAME_LEN {
        return false;
    }
    match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, rest)) => valid_part(scope) && valid_part(rest),
            None => false,
        },
        None => valid_part(name),
    }
}

/// Module specifiers of `import/export ... from "x"` and `require("x")` on one line.
/// A line opening with `}` counts as the tail of a multi-line import. Only specifiers
/// starting with a letter or `@` are returned.
pub fn specifiers_in_line(line: &str) -> Vec<&str> {
    static FROM: OnceLock<Option<Regex>> = OnceLock::new();
    static REQUIRE: OnceLock<Option<Regex>> = OnceLock::new();

    let mut found = Vec::new();
    for pattern in [
        cached_regex(
            &FROM,
            r#"(?:^\s*\}\s*|\b(?:import|export)\b[^'"]*?\s)from\s+['"]([@a-zA-Z][^'"]*)['"]"#,
        ),
        cached_regex(&REQUIRE, r#"\brequire\s*\(\s*['"]([@a-zA-Z][^'"]*)['"]"#),
    ]
    .into_iter()
    .flatten()
    {
        found.extend(
            pattern
                .captures_iter(line)
                .filter_map(|caps| caps.get(1))
                .map(|m| m.as_str()),
        );
    }
    found
}

pub struct DependencyReconciler {
    packages: PackageConfig,
    tree: TreeConfig,
}

impl DependencyReconciler {
    pub fn new(packages: PackageConfig, tree: TreeConfig) -> Self {
        Self { packages, tree }
    }

    /// Third-party base package names imported anywhere in the tree.
    pub fn imported_packages(&self, root: &Path) -> BTreeSet<String> {
        let mut packages = BTreeSet::new();
        for file in source_files(root, &self.tree) {
            for line in file.content.lines() {
                for specifier in specifiers_in_line(line) {
                    if self.packages.is_path_alias(specifier) {
                        continue;
                    }
                    let Some(base) = base_package_name(specifier) else {
                        continue;
                    };
                    if !self.packages.is_builtin(base) {
                        packages.insert(base.to_string());
                    }
                }
            }
        }
        packages
    }

    /// Packages `reconcile` would add, without touching the manifest.
    pub fn plan(&self, root: &Path, manifest: &PackageManifest) -> Vec<AddedPackage> {
        let mut planned: Vec<AddedPackage> = Vec::new();
        let mut push = |name: &str, version: String, dev: bool| {
            if !manifest.has(name) && !planned.iter().any(|p| p.name == name) {
                planned.push(AddedPackage {
                    name: name.to_string(),
                    version,
                    dev,
                });
            }
        };

        for name in self.imported_packages(root) {
            let version = self.packages.version_for(&name);
            push(name.as_str(), version, false);
        }
        for (name, version) in &self.packages.required_dependencies {
            push(name.as_str(), version.clone(), false);
        }
        for (name, version) in &self.packages.required_dev_dependencies {
            push(name.as_str(), version.clone(), true);
        }
        planned
    }

    /// Declare every missing package in `manifest`. The tree itself is never modified.
    pub fn reconcile(&self, root: &Path, manifest: &mut PackageManifest) -> ReconcileOutcome {
        let added = self.plan(root, manifest);
        for package in &added {
            let section = if package.dev {
                DependencySection::DevDependencies
            } else {
                DependencySection::Dependencies
            };
            manifest.add(section, &package.name, &package.version);
            tracing::info!(package = %package.name, version = %package.version, dev = package.dev, "added missing package");
        }
        ReconcileOutcome { added }
    }

    /// Load, reconcile and save the manifest of `root`. Nothing is written when no
    /// package was added.
    pub fn reconcile_project(&self, root: &Path) -> anyhow::Result<ReconcileOutcome> {
        let mut manifest = PackageManifest::load(root)?;
        let outcome = self.reconcile(root, &mut manifest);
        if outcome.changed() {
            manifest.save(root)?;
        }
        Ok(outcome)
    }
}
