//! Retention garbage collection for version directories.
//!
//! Only directories directly under `<root>/.arena/versions` take part; files
//! and dot-prefixed entries (such as an interrupted `.staging-*` copy) are
//! never counted and never deleted. The oldest directories (by modification
//! time, then by name) are removed until `max_versions` remain.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use arena_core::config::DEFAULT_MAX_VERSIONS;

use crate::error::{io_err, GcFailure, SyncError};

/// Outcome of a [`gc`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Version names that were deleted, oldest first.
    pub removed: Vec<String>,
    /// Version directories left in place.
    pub retained: usize,
}

/// `<root>/.arena/versions`
pub fn versions_dir(root: &Path) -> PathBuf {
    root.join(".arena").join("versions")
}

/// Prune `root`'s version directories down to `max_versions` (0 ⇒ 10).
pub fn gc(root: &Path, max_versions: usize) -> Result<GcReport, SyncError> {
    gc_keeping(root, max_versions, None)
}

/// Like [`gc`], but the version named `keep` is never deleted. It still
/// counts toward `max_versions`.
pub fn gc_keeping(
    root: &Path,
    max_versions: usize,
    keep: Option<&str>,
) -> Result<GcReport, SyncError> {
    let max_versions = if max_versions == 0 {
        DEFAULT_MAX_VERSIONS
    } else {
        max_versions
    };

    let dir = versions_dir(root);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(GcReport::default()),
        Err(err) => return Err(io_err(&dir, err)),
    };

    let mut pinned = 0usize;
    let mut versions: Vec<(SystemTime, String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_err(&dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
        if !ty.is_dir() {
            continue;
        }
        if keep == Some(name.as_str()) {
            pinned += 1;
            continue;
        }
        let path = entry.path();
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| io_err(&path, e))?;
        versions.push((modified, name, path));
    }

    let total = versions.len() + pinned;
    if total <= max_versions {
        return Ok(GcReport {
            removed: vec![],
            retained: total,
        });
    }

    versions.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    let excess = total - max_versions;

    let mut report = GcReport::default();
    let mut failures = Vec::new();
    for (_, name, path) in versions.drain(..excess) {
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::debug!(version = %name, "pruned version");
                report.removed.push(name);
            }
            Err(source) => {
                tracing::warn!(path = %path.display(), error = %source, "failed to prune version");
                failures.push(GcFailure { path, source });
            }
        }
    }
    report.retained = versions.len() + pinned + failures.len();

    if !failures.is_empty() {
        return Err(SyncError::Gc { failures });
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
