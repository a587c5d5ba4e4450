//! Engine configuration, read from `<home>/.arena/config.yaml`.
//!
//! Every field is optional in the file; missing fields take the defaults
//! below. Relative paths are resolved against `<home>/.arena/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_MAX_VERSIONS: usize = 10;
pub const DEFAULT_INDEX_DIR: &str = "template-index";

/// `<home>/.arena`
pub fn arena_root(home: &Path) -> PathBuf {
    home.join(".arena")
}

/// `<home>/.arena/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    arena_root(home).join("config.yaml")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the per-workspace content tree.
    pub base_dir: PathBuf,
    /// Directory (relative to `<workspace>/<namespace>`) holding index files.
    pub index_dir: String,
    /// Versions retained per target path.
    pub max_versions: usize,
    /// Scratch space for in-progress fetches. Keep it on the same filesystem
    /// as `base_dir` so stores are a single rename.
    pub work_dir: PathBuf,
    pub fetch_timeout_secs: u64,
    /// Concurrent reconciliation workers in the daemon.
    pub workers: usize,
    /// Period of the full resync that re-enqueues every source.
    pub resync_secs: u64,
    /// When `false` the content store is disabled and syncs are no-ops.
    pub persist: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("workspaces"),
            index_dir: DEFAULT_INDEX_DIR.to_string(),
            max_versions: DEFAULT_MAX_VERSIONS,
            work_dir: PathBuf::from("work"),
            fetch_timeout_secs: 300,
            workers: 4,
            resync_secs: 600,
            persist: true,
        }
    }
}

impl EngineConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_secs.max(1))
    }

    /// Content store base, or `None` when persistence is disabled.
    pub fn content_base(&self) -> Option<&Path> {
        self.persist.then_some(self.base_dir.as_path())
    }

    fn resolve_paths(mut self, home: &Path) -> Self {
        let root = arena_root(home);
        if self.base_dir.is_relative() {
            self.base_dir = root.join(&self.base_dir);
        }
        if self.work_dir.is_relative() {
            self.work_dir = root.join(&self.work_dir);
        }
        self
    }
}

/// Load the engine config for `home`, falling back to defaults when the file
/// is absent.
pub fn load_at(home: &Path) -> Result<EngineConfig, ConfigError> {
    let path = config_path_at(home);
    let config = match std::fs::read_to_string(&path) {
        Ok(contents) if contents.trim().is_empty() => EngineConfig::default(),
        Ok(contents) => serde_yaml::from_str(&contents).map_err(|e| ConfigError::Load {
            path: path.clone(),
            message: e.to_string(),
        })?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => EngineConfig::default(),
        Err(err) => {
            return Err(ConfigError::Load {
                path,
                message: err.to_string(),
            })
        }
    };
    Ok(config.resolve_paths(home))
}

/// `load_at` convenience wrapper using `dirs::home_dir()`.
pub fn load() -> Result<EngineConfig, ConfigError> {
    let home = dirs::home_dir().ok_or_else(|| ConfigError::Load {
        path: PathBuf::from("~/.arena/config.yaml"),
        message: "cannot determine home directory".to_string(),
    })?;
    load_at(&home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_file_missing() {
        let home = TempDir::new().unwrap();
        let config = load_at(home.path()).expect("load");
        assert_eq!(config.max_versions, DEFAULT_MAX_VERSIONS);
        assert_eq!(config.base_dir, home.path().join(".arena").join("workspaces"));
        assert_eq!(config.work_dir, home.path().join(".arena").join("work"));
        assert_eq!(config.content_base(), Some(config.base_dir.as_path()));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(arena_root(home.path())).unwrap();
        std::fs::write(
            config_path_at(home.path()),
            "max_versions: 3\nbase_dir: /srv/arena\npersist: false\n",
        )
        .unwrap();

        let config = load_at(home.path()).expect("load");
        assert_eq!(config.max_versions, 3);
        assert_eq!(config.base_dir, PathBuf::from("/srv/arena"));
        assert_eq!(config.index_dir, DEFAULT_INDEX_DIR);
        assert!(config.content_base().is_none());
    }

    #[test]
    fn malformed_file_is_a_load_error() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(arena_root(home.path())).unwrap();
        std::fs::write(config_path_at(home.path()), "max_versions: [not a number\n").unwrap();
        let err = load_at(home.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }), "got: {err}");
    }
}
