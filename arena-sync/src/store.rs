//! Versioned, deduplicated content store.
//!
//! ## Layout
//!
//! ```text
//! {base}/{workspace}/{namespace}/{target}/.arena/HEAD
//! {base}/{workspace}/{namespace}/{target}/.arena/versions/{version}/...
//! ```
//!
//! ## `sync` protocol
//!
//! 1. Compute the version of the artifact.
//! 2. If `versions/{version}` exists, reuse it. The artifact is left alone.
//! 3. Otherwise rename the artifact into place. When the rename fails (for
//!    example across filesystems) copy into `versions/.staging-{version}`,
//!    rename the staging directory into place and remove the source.
//! 4. Point `HEAD` at the version, only after step 3 succeeded.
//! 5. Run [`gc_keeping`](crate::gc::gc_keeping) on the target, pinning the
//!    version `HEAD` names.
//!
//! A store without a base directory is disabled: `sync` computes the version
//! and returns without touching the filesystem.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;

use arena_core::config::{EngineConfig, DEFAULT_MAX_VERSIONS};
use arena_core::types::Artifact;

use crate::error::{io_err, SyncError};
use crate::gc::{gc_keeping, versions_dir};
use crate::version::compute_version;
use crate::writer::{copy_tree, write_atomic};

/// Result of a successful [`ContentStore::sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedVersion {
    /// `{target}/.arena/versions/{version}`, relative to the namespace dir.
    pub content_path: String,
    pub version: String,
    /// `true` when the version directory already existed.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    base: Option<PathBuf>,
    max_versions: usize,
}

impl ContentStore {
    pub fn new(base: impl Into<PathBuf>, max_versions: usize) -> Self {
        Self {
            base: Some(base.into()),
            max_versions,
        }
    }

    /// A store with no backing location; every `sync` is a no-op.
    pub fn disabled() -> Self {
        Self {
            base: None,
            max_versions: DEFAULT_MAX_VERSIONS,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        match config.content_base() {
            Some(base) => Self::new(base, config.max_versions),
            None => Self::disabled(),
        }
    }

    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    pub fn max_versions(&self) -> usize {
        self.max_versions
    }

    /// `{base}/{workspace}/{namespace}/{target}`, or `None` when disabled.
    pub fn target_root(
        &self,
        workspace: &str,
        namespace: &str,
        target_path: &str,
    ) -> Result<Option<PathBuf>, SyncError> {
        check_segment(workspace)?;
        check_segment(namespace)?;
        let target = check_target(target_path)?;
        Ok(self
            .base
            .as_ref()
            .map(|base| base.join(workspace).join(namespace).join(target)))
    }

    /// Store `artifact` under its content version and advance `HEAD`.
    pub fn sync(
        &self,
        workspace: &str,
        namespace: &str,
        target_path: &str,
        artifact: &Artifact,
    ) -> Result<SyncedVersion, SyncError> {
        let root = self.target_root(workspace, namespace, target_path)?;
        let target = check_target(target_path)?;

        let Some(root) = root else {
            let version = compute_version(artifact)?;
            tracing::debug!(%version, "content store disabled; skipping sync");
            return Ok(SyncedVersion {
                content_path: content_path(&target, &version),
                version,
                reused: false,
            });
        };

        // A re-fetch of unchanged content may leave nothing on disk at the
        // artifact path, so only hash the tree when the checksum can't be used.
        let version = compute_version(artifact)?;
        let versions = versions_dir(&root);
        let dest = versions.join(&version);

        let reused = dest.is_dir();
        if reused {
            tracing::debug!(%version, path = %dest.display(), "version already stored");
        } else {
            let meta = fs::metadata(&artifact.path).map_err(|e| io_err(&artifact.path, e))?;
            if !meta.is_dir() {
                return Err(SyncError::InvalidArtifact {
                    path: artifact.path.clone(),
                });
            }
            fs::create_dir_all(&versions).map_err(|e| io_err(&versions, e))?;
            relocate(&artifact.path, &dest, &versions, &version)?;
            tracing::info!(%version, path = %dest.display(), "stored version");
        }

        // A reused version becomes the newest again; HEAD is pinned regardless.
        filetime::set_file_mtime(&dest, FileTime::now()).map_err(|e| io_err(&dest, e))?;
        self.write_head(&root, &version)?;
        gc_keeping(&root, self.max_versions, Some(&version))?;

        Ok(SyncedVersion {
            content_path: content_path(&target, &version),
            version,
            reused,
        })
    }

    /// The version `HEAD` points at, if any sync has succeeded.
    pub fn head(
        &self,
        workspace: &str,
        namespace: &str,
        target_path: &str,
    ) -> Result<Option<String>, SyncError> {
        let Some(root) = self.target_root(workspace, namespace, target_path)? else {
            return Ok(None);
        };
        read_head(&root)
    }

    /// Stored version names, sorted.
    pub fn list_versions(
        &self,
        workspace: &str,
        namespace: &str,
        target_path: &str,
    ) -> Result<Vec<String>, SyncError> {
        let Some(root) = self.target_root(workspace, namespace, target_path)? else {
            return Ok(vec![]);
        };
        let dir = versions_dir(&root);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(&dir, err)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().map_err(|e| io_err(entry.path(), e))?.is_dir() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove the target's `.arena` tree. Returns `false` when nothing existed.
    pub fn purge(
        &self,
        workspace: &str,
        namespace: &str,
        target_path: &str,
    ) -> Result<bool, SyncError> {
        let Some(root) = self.target_root(workspace, namespace, target_path)? else {
            return Ok(false);
        };
        let arena = root.join(".arena");
        match fs::remove_dir_all(&arena) {
            Ok(()) => {
                tracing::info!(path = %arena.display(), "purged stored versions");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_err(&arena, err)),
        }
    }

    fn write_head(&self, root: &Path, version: &str) -> Result<(), SyncError> {
        if read_head(root)?.as_deref() == Some(version) {
            return Ok(());
        }
        write_atomic(&head_path(root), version.as_bytes())
    }
}

/// `<root>/.arena/HEAD`
pub fn head_path(root: &Path) -> PathBuf {
    root.join(".arena").join("HEAD")
}

fn read_head(root: &Path) -> Result<Option<String>, SyncError> {
    let path = head_path(root);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let version = contents.trim();
            Ok((!version.is_empty()).then(|| version.to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(&path, err)),
    }
}

fn content_path(target: &str, version: &str) -> String {
    format!("{target}/.arena/versions/{version}")
}

fn relocate(src: &Path, dest: &Path, versions: &Path, version: &str) -> Result<(), SyncError> {
    relocate_with(src, dest, versions, version, |from, to| fs::rename(from, to))
}

/// [`relocate`] with the rename primitive supplied by the caller.
pub(crate) fn relocate_with<R>(
    src: &Path,
    dest: &Path,
    versions: &Path,
    version: &str,
    rename: R,
) -> Result<(), SyncError>
where
    R: Fn(&Path, &Path) -> io::Result<()>,
{
    let rename_err = match rename(src, dest) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    tracing::debug!(
        from = %src.display(),
        to = %dest.display(),
        error = %rename_err,
        "rename failed; copying"
    );

    let staging = versions.join(format!(".staging-{version}"));
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| io_err(&staging, e))?;
    }
    if let Err(err) = copy_tree(src, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }
    if let Err(err) = rename(&staging, dest) {
        let _ = fs::remove_dir_all(&staging);
        return Err(io_err(dest, err));
    }
    if let Err(err) = fs::remove_dir_all(src) {
        tracing::warn!(path = %src.display(), error = %err, "failed to remove copied artifact");
    }
    Ok(())
}

pub(crate) fn check_segment(segment: &str) -> Result<(), SyncError> {
    let reason = if segment.is_empty() {
        Some("must not be empty")
    } else if segment == "." || segment == ".." {
        Some("must not be a relative marker")
    } else if segment.contains(['/', '\\']) {
        Some("must be a single path segment")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SyncError::InvalidTarget {
            path: segment.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Normalise a target path: relative, no `..`, no leading or trailing `/`.
pub(crate) fn check_target(target_path: &str) -> Result<String, SyncError> {
    let invalid = |reason| SyncError::InvalidTarget {
        path: target_path.to_string(),
        reason,
    };
    if target_path.starts_with('/') || Path::new(target_path).is_absolute() {
        return Err(invalid("must be relative"));
    }
    let mut parts = Vec::new();
    for component in Path::new(target_path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("must be relative")),
        }
    }
    if parts.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if parts.iter().any(|p| p == ".arena") {
        return Err(invalid("must not contain '.arena'"));
    }
    Ok(parts.join("/"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
