//! The on-disk project tree: writing recovered files and walking source files.

pub mod manifest;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::TreeConfig;
use crate::util::{resolve_project_path_allow_new, write_atomic};

/// One generated file. `path` is relative to the project root and never escapes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub content: String,
}

/// A source file found by [`source_files`].
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Root-relative path with `/` separators.
    pub relative: String,
    pub absolute: PathBuf,
    pub content: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MaterializeReport {
    pub written: Vec<String>,
    /// Paths refused or failed, with the reason.
    pub rejected: Vec<(String, String)>,
}

/// Write every record beneath `root`, creating directories as needed.
///
/// Individual failures are collected rather than aborting the batch; only an unusable
/// root is an error.
pub fn materialize(root: &Path, records: &[FileRecord]) -> anyhow::Result<MaterializeReport> {
    fs::create_dir_all(root)?;
    let mut report = MaterializeReport::default();

    for record in records {
        match write_record(root, record) {
            Ok(()) => report.written.push(record.path.clone()),
            Err(reason) => {
                tracing::warn!(path = %record.path, reason = %reason, "file not written");
                report.rejected.push((record.path.clone(), reason));
            }
        }
    }

    tracing::info!(
        written = report.written.len(),
        rejected = report.rejected.len(),
        root = %root.display(),
        "materialized project files"
    );
    Ok(report)
}

fn write_record(root: &Path, record: &FileRecord) -> Result<(), String> {
    let resolved = resolve_project_path_allow_new(root, Path::new(&record.path))?;
    if let Some(parent) = resolved.absolute.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create directory: {}", e))?;
    }
    // Re-check now that intermediate directories exist.
    resolve_project_path_allow_new(root, &resolved.relative)?;
    write_atomic(&resolved.absolute, &record.content)
        .map_err(|e| format!("Failed to write file: {}", e))
}

fn should_ignore(entry: &DirEntry, tree: &TreeConfig) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| tree.ignored_dirs.iter().any(|d| d == name))
            .unwrap_or(false)
}

fn has_source_extension(path: &Path, tree: &TreeConfig) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| tree.source_extensions.iter().any(|s| s == ext))
        .unwrap_or(false)
}

/// Every readable source file under `root`, in a stable (sorted) order.
///
/// Ignored directories are pruned, symlinks are not followed, and unreadable or
/// non-UTF-8 files are skipped.
pub fn source_files(root: &Path, tree: &TreeConfig) -> Vec<SourceFile> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !should_ignore(e, tree))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() || !has_source_extension(entry.path(), tree) {
            continue;
        }
        let path = entry.path();
        let Ok(content) = fs::read_to_string(path) else {
            tracing::debug!(path = %path.display(), "skipping unreadable source file");
            continue;
        };
        files.push(SourceFile {
            relative: relative_slash_path(root, path),
            absolute: path.to_path_buf(),
            content,
        });
    }
    files
}

pub(crate) fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
