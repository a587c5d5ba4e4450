//! Per-source template index files.
//!
//! `{base}/{workspace}/{namespace}/{index_dir}/{source}.json` holds a JSON
//! array of [`Template`]. The file is replaced atomically, so readers see
//! either the previous or the new array, never a partial write.

use std::fs;
use std::path::{Path, PathBuf};

use arena_core::config::{EngineConfig, DEFAULT_INDEX_DIR};
use arena_core::types::Template;

use crate::error::{io_err, SyncError};
use crate::store::{check_segment, check_target};
use crate::writer::write_atomic;

#[derive(Debug, Clone)]
pub struct TemplateIndexer {
    base: Option<PathBuf>,
    index_dir: String,
}

impl TemplateIndexer {
    pub fn new(base: impl Into<PathBuf>, index_dir: impl Into<String>) -> Self {
        let index_dir = index_dir.into();
        Self {
            base: Some(base.into()),
            index_dir: if index_dir.trim().is_empty() {
                DEFAULT_INDEX_DIR.to_string()
            } else {
                index_dir
            },
        }
    }

    /// An indexer that writes nothing.
    pub fn disabled() -> Self {
        Self {
            base: None,
            index_dir: DEFAULT_INDEX_DIR.to_string(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        match config.content_base() {
            Some(base) => Self::new(base, config.index_dir.clone()),
            None => Self::disabled(),
        }
    }

    /// Location of the index for `source_name`, or `None` when disabled.
    /// The index directory must stay inside `{workspace}/{namespace}`.
    pub fn index_path(
        &self,
        workspace: &str,
        namespace: &str,
        source_name: &str,
    ) -> Result<Option<PathBuf>, SyncError> {
        let Some(base) = &self.base else {
            return Ok(None);
        };
        check_segment(workspace)?;
        check_segment(namespace)?;
        check_segment(source_name)?;
        let index_dir = check_target(&self.index_dir)?;
        Ok(Some(
            base.join(workspace)
                .join(namespace)
                .join(index_dir)
                .join(format!("{source_name}.json")),
        ))
    }

    /// Serialize `templates` (possibly empty) as the source's index.
    pub fn write_index(
        &self,
        workspace: &str,
        namespace: &str,
        source_name: &str,
        templates: &[Template],
    ) -> Result<Option<PathBuf>, SyncError> {
        let Some(path) = self.index_path(workspace, namespace, source_name)? else {
            return Ok(None);
        };
        let json = serde_json::to_vec_pretty(templates)?;
        write_atomic(&path, &json)?;
        tracing::debug!(path = %path.display(), count = templates.len(), "wrote template index");
        Ok(Some(path))
    }

    /// Read a previously written index. A missing file reads as empty.
    pub fn read_index(
        &self,
        workspace: &str,
        namespace: &str,
        source_name: &str,
    ) -> Result<Vec<Template>, SyncError> {
        let Some(path) = self.index_path(workspace, namespace, source_name)? else {
            return Ok(vec![]);
        };
        read_index_file(&path)
    }

    /// Delete the source's index. Returns `false` when there was none.
    pub fn remove_index(
        &self,
        workspace: &str,
        namespace: &str,
        source_name: &str,
    ) -> Result<bool, SyncError> {
        let Some(path) = self.index_path(workspace, namespace, source_name)? else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_err(&path, err)),
        }
    }
}

fn read_index_file(path: &Path) -> Result<Vec<Template>, SyncError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
        Err(err) => Err(io_err(path, err)),
    }
}
