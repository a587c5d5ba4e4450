//! Error types for arena-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from source store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error (status documents).
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error on load — includes the file path.
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// `dirs::home_dir()` returned `None` — cannot locate `~/.arena/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// A source key that is not `<namespace>/<name>`.
    #[error("invalid source key '{key}'; expected <namespace>/<name>")]
    InvalidKey { key: String },
}

/// Errors in user-supplied configuration. Terminal until the input changes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported source type '{0}'")]
    UnsupportedSourceType(String),

    #[error("source type '{source_type}' requires a '{field}' configuration block")]
    MissingSourceConfig {
        source_type: String,
        field: &'static str,
    },

    #[error("'{field}' must not be empty")]
    EmptyField { field: &'static str },

    #[error("invalid sync interval '{value}': {reason}")]
    InvalidInterval { value: String, reason: String },

    #[error("failed to load engine config at {path}: {message}")]
    Load { path: PathBuf, message: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
