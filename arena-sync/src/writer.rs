//! Atomic file writes and tree copies.
//!
//! ## `write_atomic` protocol
//!
//! 1. Ensure the parent directory exists.
//! 2. Write to `<path>.arena.tmp`.
//! 3. Rename to the final path (atomic on POSIX).
//! 4. On rename failure remove the `.tmp` file; the previous content stays.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{io_err, SyncError};

/// Atomically replace `path` with `contents`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), SyncError> {
    let tmp = PathBuf::from(format!("{}.arena.tmp", path.display()));
    write_atomic_with_tmp(path, contents, &tmp)
}

fn write_atomic_with_tmp(path: &Path, contents: &[u8], tmp: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    if let Some(tmp_parent) = tmp.parent() {
        fs::create_dir_all(tmp_parent).map_err(|e| io_err(tmp_parent, e))?;
    }
    fs::write(tmp, contents).map_err(|e| io_err(tmp, e))?;

    if let Err(e) = fs::rename(tmp, path) {
        let _ = fs::remove_file(tmp);
        return Err(io_err(path, e));
    }

    tracing::debug!(path = %path.display(), "wrote");
    Ok(())
}

/// Recursively copy the tree at `src` into `dst` (created if absent).
///
/// Symlinks are recreated, not followed. The first failing entry aborts the
/// copy; the caller owns cleanup of the partial `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64, SyncError> {
    fs::create_dir_all(dst).map_err(|e| io_err(dst, e))?;
    let mut copied = 0u64;

    for entry in fs::read_dir(src).map_err(|e| io_err(src, e))? {
        let entry = entry.map_err(|e| io_err(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ty = entry.file_type().map_err(|e| io_err(&from, e))?;

        if ty.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else if ty.is_symlink() {
            let target = fs::read_link(&from).map_err(|e| io_err(&from, e))?;
            symlink(&target, &to).map_err(|e| io_err(&to, e))?;
        } else {
            copied += fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    // No portable symlink creation; copy the target's bytes instead.
    let resolved = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
    fs::copy(resolved, link).map(|_| ())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
