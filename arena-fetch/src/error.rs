//! Error types for arena-fetch.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while retrieving content from an origin.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config store or secret document does not exist.
    #[error("{kind} '{name}' not found at {path}")]
    NotFound {
        kind: &'static str,
        name: String,
        path: PathBuf,
    },

    #[error("failed to parse {path}: {message}")]
    Document { path: PathBuf, message: String },

    /// An entry would land outside the fetch directory.
    #[error("refusing unsafe entry path '{path}'")]
    UnsafePath { path: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("invalid archive from {url}: {message}")]
    Archive { url: String, message: String },

    #[error("archive from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    /// A blocking helper task panicked or was cancelled.
    #[error("fetch task failed: {0}")]
    Task(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.into(),
        source,
    }
}
