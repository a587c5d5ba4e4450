//! Per-namespace YAML source store.
//!
//! # Storage layout
//!
//! ```text
//! ~/.arena/
//!   sources/
//!     <namespace>/
//!       <name>.yaml          (metadata + spec — user owned, mode 0600)
//!       <name>.status.json   (status — engine owned, mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! The reconciler talks to the store through the [`SourceStore`] trait.

use std::path::{Path, PathBuf};

use crate::config::arena_root;
use crate::error::{io_err, StoreError};
use crate::types::{ArenaTemplateSource, SourceKey, TemplateSourceStatus};

/// Read/write access to template sources, as needed by the reconciler.
pub trait SourceStore: Send + Sync {
    /// Load a source with its status; `None` when it does not exist.
    fn get(&self, key: &SourceKey) -> Result<Option<ArenaTemplateSource>, StoreError>;

    /// Persist the status of an existing source.
    fn update_status(&self, key: &SourceKey, status: &TemplateSourceStatus) -> Result<(), StoreError>;

    /// All sources, sorted by namespace then name.
    fn list(&self) -> Result<Vec<ArenaTemplateSource>, StoreError>;
}

/// [`SourceStore`] backed by the `~/.arena/sources` tree.
#[derive(Debug, Clone)]
pub struct FsSourceStore {
    home: PathBuf,
}

impl FsSourceStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

impl SourceStore for FsSourceStore {
    fn get(&self, key: &SourceKey) -> Result<Option<ArenaTemplateSource>, StoreError> {
        load_source_at(&self.home, key)
    }

    fn update_status(&self, key: &SourceKey, status: &TemplateSourceStatus) -> Result<(), StoreError> {
        save_status_at(&self.home, key, status)
    }

    fn list(&self) -> Result<Vec<ArenaTemplateSource>, StoreError> {
        list_sources_at(&self.home)
    }
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.arena/sources/`
pub fn sources_root_at(home: &Path) -> PathBuf {
    arena_root(home).join("sources")
}

/// `<home>/.arena/sources/<namespace>/<name>.yaml` — pure, no I/O.
pub fn source_path_at(home: &Path, key: &SourceKey) -> PathBuf {
    sources_root_at(home)
        .join(&key.namespace.0)
        .join(format!("{}.yaml", key.name.0))
}

/// `<home>/.arena/sources/<namespace>/<name>.status.json` — pure, no I/O.
pub fn status_path_at(home: &Path, key: &SourceKey) -> PathBuf {
    sources_root_at(home)
        .join(&key.namespace.0)
        .join(format!("{}.status.json", key.name.0))
}

/// Recover the key of a source document path, if `path` is one.
pub fn key_for_path(home: &Path, path: &Path) -> Option<SourceKey> {
    let relative = path.strip_prefix(sources_root_at(home)).ok()?;
    let mut parts = relative.components();
    let namespace = parts.next()?.as_os_str().to_str()?;
    let file = parts.next()?.as_os_str().to_str()?;
    if parts.next().is_some() {
        return None;
    }
    let name = file
        .strip_suffix(".status.json")
        .or_else(|| file.strip_suffix(".yaml"))?;
    format!("{namespace}/{name}").parse().ok()
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load a source and its status. Returns `Ok(None)` when the document is
/// absent. A missing or unreadable status file yields a default status.
pub fn load_source_at(home: &Path, key: &SourceKey) -> Result<Option<ArenaTemplateSource>, StoreError> {
    let path = source_path_at(home, key);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&path, err)),
    };
    let mut source: ArenaTemplateSource =
        serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;

    // The file location is authoritative for identity.
    source.metadata.namespace = key.namespace.clone();
    source.metadata.name = key.name.clone();
    source.status = load_status_at(home, key)?;
    Ok(Some(source))
}

/// `load_source_at` convenience wrapper.
pub fn load_source(key: &SourceKey) -> Result<Option<ArenaTemplateSource>, StoreError> {
    load_source_at(&home()?, key)
}

/// Load the status document for `key`, or a default status.
pub fn load_status_at(home: &Path, key: &SourceKey) -> Result<TemplateSourceStatus, StoreError> {
    let path = status_path_at(home, key);
    match std::fs::read_to_string(&path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(status) => Ok(status),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "discarding unreadable status");
                Ok(TemplateSourceStatus::default())
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TemplateSourceStatus::default()),
        Err(err) => Err(io_err(&path, err)),
    }
}

/// Walk `<home>/.arena/sources/*/*.yaml` and return every source, sorted by
/// namespace then name. Documents that fail to parse are skipped with a
/// warning so one bad file does not hide the rest.
pub fn list_sources_at(home: &Path) -> Result<Vec<ArenaTemplateSource>, StoreError> {
    let root = sources_root_at(home);
    if !root.exists() {
        return Ok(vec![]);
    }

    let mut namespaces: Vec<_> = std::fs::read_dir(&root)
        .map_err(|e| io_err(&root, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .collect();
    namespaces.sort_by_key(|e| e.file_name());

    let mut result = Vec::new();
    for ns_entry in namespaces {
        let ns_path = ns_entry.path();
        let mut files: Vec<_> = std::fs::read_dir(&ns_path)
            .map_err(|e| io_err(&ns_path, e))?
            .filter_map(|e| e.ok())
            .collect();
        files.sort_by_key(|e| e.file_name());

        for file in files {
            let Some(key) = key_for_path(home, &file.path()) else {
                continue;
            };
            if !file.file_name().to_string_lossy().ends_with(".yaml") {
                continue;
            }
            match load_source_at(home, &key) {
                Ok(Some(source)) => result.push(source),
                Ok(None) => {}
                Err(err @ StoreError::Parse { .. }) => {
                    tracing::warn!(source = %key, error = %err, "skipping malformed source");
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(result)
}

/// `list_sources_at` convenience wrapper.
pub fn list_sources() -> Result<Vec<ArenaTemplateSource>, StoreError> {
    list_sources_at(&home()?)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the metadata and spec of `source`. Status is not written.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_source_at(home: &Path, source: &ArenaTemplateSource) -> Result<(), StoreError> {
    let key = source.key();
    let path = source_path_at(home, &key);
    let yaml = serde_yaml::to_string(source)?;
    write_atomic(&path, yaml.as_bytes())
}

/// `save_source_at` convenience wrapper.
pub fn save_source(source: &ArenaTemplateSource) -> Result<(), StoreError> {
    save_source_at(&home()?, source)
}

/// Atomically save the status document for `key`.
pub fn save_status_at(home: &Path, key: &SourceKey, status: &TemplateSourceStatus) -> Result<(), StoreError> {
    let path = status_path_at(home, key);
    let json = serde_json::to_string_pretty(status)?;
    write_atomic(&path, json.as_bytes())
}

// ---------------------------------------------------------------------------
// 4. Delete
// ---------------------------------------------------------------------------

/// Remove the document and status of `key`. Returns `false` if the source
/// did not exist. Stored content is left alone.
pub fn delete_source_at(home: &Path, key: &SourceKey) -> Result<bool, StoreError> {
    let doc = source_path_at(home, key);
    let existed = doc.exists();
    for path in [doc, status_path_at(home, key)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&path, err)),
        }
    }
    Ok(existed)
}

/// `delete_source_at` convenience wrapper.
pub fn delete_source(key: &SourceKey) -> Result<bool, StoreError> {
    delete_source_at(&home()?, key)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid source store path")));
    };
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, err));
    }
    Ok(())
}

fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfigStoreSource, ObjectMeta, Phase, SourceType, TemplateSourceSpec};
    use tempfile::TempDir;

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn key() -> SourceKey {
        SourceKey::new("team-a", "starter")
    }

    fn source() -> ArenaTemplateSource {
        ArenaTemplateSource {
            metadata: ObjectMeta {
                name: "starter".into(),
                namespace: "team-a".into(),
                workspace: None,
                generation: 3,
            },
            spec: TemplateSourceSpec {
                source_type: SourceType::ConfigStore,
                config_store: Some(ConfigStoreSource {
                    name: "starter".to_string(),
                    key_prefix: None,
                }),
                ..TemplateSourceSpec::default()
            },
            status: TemplateSourceStatus::default(),
        }
    }

    #[test]
    fn source_path_is_correct() {
        let home = make_home();
        let path = source_path_at(home.path(), &key());
        assert!(path.ends_with(".arena/sources/team-a/starter.yaml"));
        assert_eq!(key_for_path(home.path(), &path), Some(key()));
        assert_eq!(key_for_path(home.path(), &status_path_at(home.path(), &key())), Some(key()));
        assert_eq!(key_for_path(home.path(), home.path()), None);
    }

    #[test]
    fn save_and_load_roundtrip_with_status() {
        let home = make_home();
        save_source_at(home.path(), &source()).expect("save");

        let loaded = load_source_at(home.path(), &key()).expect("load").expect("present");
        assert_eq!(loaded.metadata.generation, 3);
        assert_eq!(loaded.status.phase, None);

        let status = TemplateSourceStatus {
            phase: Some(Phase::Ready),
            observed_generation: 3,
            ..TemplateSourceStatus::default()
        };
        save_status_at(home.path(), &key(), &status).expect("save status");
        let loaded = load_source_at(home.path(), &key()).expect("load").expect("present");
        assert_eq!(loaded.status.phase(), Phase::Ready);
    }

    #[test]
    fn missing_source_is_none() {
        let home = make_home();
        assert!(load_source_at(home.path(), &key()).expect("load").is_none());
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = make_home();
        save_source_at(home.path(), &source()).expect("save");
        let tmp = source_path_at(home.path(), &key()).with_file_name("starter.yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn corrupt_status_falls_back_to_default() {
        let home = make_home();
        save_source_at(home.path(), &source()).expect("save");
        std::fs::write(status_path_at(home.path(), &key()), "{not json").unwrap();
        let loaded = load_source_at(home.path(), &key()).expect("load").expect("present");
        assert_eq!(loaded.status, TemplateSourceStatus::default());
    }

    #[test]
    fn list_skips_malformed_documents() {
        let home = make_home();
        save_source_at(home.path(), &source()).expect("save");
        let bad = source_path_at(home.path(), &SourceKey::new("team-a", "broken"));
        std::fs::write(&bad, "metadata: [unclosed").unwrap();

        let all = list_sources_at(home.path()).expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key(), key());
    }

    #[test]
    fn delete_removes_document_and_status() {
        let home = make_home();
        save_source_at(home.path(), &source()).expect("save");
        save_status_at(home.path(), &key(), &TemplateSourceStatus::default()).expect("status");
        assert!(delete_source_at(home.path(), &key()).expect("delete"));
        assert!(!source_path_at(home.path(), &key()).exists());
        assert!(!status_path_at(home.path(), &key()).exists());
        assert!(!delete_source_at(home.path(), &key()).expect("second delete"));
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(StoreError::HomeNotFound.to_string().contains("home directory"));
    }
}
