//! Content-derived version identifiers.
//!
//! A version is the first [`VERSION_LEN`] hex characters of either the
//! artifact's `sha256:` checksum or, when that is unusable, a SHA-256 digest
//! of the fetched tree. The tree digest covers sorted relative paths, entry
//! kinds, file lengths and bytes, and symlink targets; it never reads
//! timestamps or permissions.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

use arena_core::types::Artifact;

use crate::error::{io_err, SyncError};

/// Length of a version identifier in hex characters.
pub const VERSION_LEN: usize = 12;

/// The only checksum algorithm whose digest is used directly.
pub const SHA256_PREFIX: &str = "sha256:";

/// Compute the version identifier of `artifact`.
pub fn compute_version(artifact: &Artifact) -> Result<String, SyncError> {
    if let Some(version) = version_from_checksum(&artifact.checksum) {
        return Ok(version);
    }
    let digest = hash_tree(&artifact.path)?;
    Ok(digest[..VERSION_LEN].to_string())
}

/// The version encoded in a `sha256:<hex>` checksum, if it carries at least
/// [`VERSION_LEN`] hex characters. Case is preserved.
pub fn version_from_checksum(checksum: &str) -> Option<String> {
    let hex = checksum.strip_prefix(SHA256_PREFIX)?;
    let head = hex.get(..VERSION_LEN)?;
    head.chars()
        .all(|c| c.is_ascii_hexdigit())
        .then(|| head.to_string())
}

/// Full lowercase SHA-256 hex digest of the tree rooted at `root`.
///
/// A regular file at `root` is hashed as a single unnamed entry.
pub fn hash_tree(root: &Path) -> Result<String, SyncError> {
    let mut hasher = Sha256::new();
    let meta = fs::symlink_metadata(root).map_err(|e| io_err(root, e))?;
    if meta.is_dir() {
        hash_dir(&mut hasher, root, "")?;
    } else {
        hash_entry(&mut hasher, root, "", &meta)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_dir(hasher: &mut Sha256, dir: &Path, prefix: &str) -> Result<(), SyncError> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| io_err(dir, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| io_err(dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let meta = fs::symlink_metadata(&path).map_err(|e| io_err(&path, e))?;
        hash_entry(hasher, &path, &relative, &meta)?;
        if meta.is_dir() {
            hash_dir(hasher, &path, &relative)?;
        }
    }
    Ok(())
}

fn hash_entry(
    hasher: &mut Sha256,
    path: &Path,
    relative: &str,
    meta: &fs::Metadata,
) -> Result<(), SyncError> {
    let kind: &[u8] = if meta.is_dir() {
        b"d"
    } else if meta.file_type().is_symlink() {
        b"l"
    } else {
        b"f"
    };
    hasher.update(kind);
    hasher.update([0u8]);
    hasher.update(relative.as_bytes());
    hasher.update([0u8]);

    if meta.file_type().is_symlink() {
        let target = fs::read_link(path).map_err(|e| io_err(path, e))?;
        hasher.update(target.to_string_lossy().as_bytes());
        hasher.update([0u8]);
    } else if meta.is_file() {
        hasher.update(meta.len().to_le_bytes());
        let mut file = fs::File::open(path).map_err(|e| io_err(path, e))?;
        io::copy(&mut file, hasher).map_err(|e| io_err(path, e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
