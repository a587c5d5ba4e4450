//! Error types for arena-sync.

use std::path::PathBuf;

use thiserror::Error;

/// A version directory that could not be removed during garbage collection.
#[derive(Debug)]
pub struct GcFailure {
    pub path: PathBuf,
    pub source: std::io::Error,
}

/// All errors that can arise from content store, GC, and index operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (template index).
    #[error("index JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Target paths must be relative and stay inside the namespace tree.
    #[error("invalid target path '{path}': {reason}")]
    InvalidTarget { path: String, reason: &'static str },

    /// The artifact root is not a directory.
    #[error("artifact at {path} is not a directory")]
    InvalidArtifact { path: PathBuf },

    /// One or more version directories could not be removed.
    #[error("garbage collection failed for {} version(s): {}", .failures.len(), describe(.failures))]
    Gc { failures: Vec<GcFailure> },
}

fn describe(failures: &[GcFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.path.display(), f.source))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
