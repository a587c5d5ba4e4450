//! The fetcher capability and fetcher selection.
//!
//! Selection is a total match over [`SourceType`]: every recognised type maps
//! to exactly one fetcher and requires its own payload. It never performs I/O,
//! so a misconfigured source is rejected before any work is scheduled.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use arena_core::error::ConfigError;
use arena_core::types::{Artifact, SourceKey, SourceType, TemplateSourceSpec};

use crate::configstore::ConfigStoreFetcher;
use crate::credentials::{CredentialLoader, FsCredentialLoader};
use crate::error::{io_err, FetchError};
use crate::git::GitFetcher;
use crate::registry::RegistryFetcher;

/// Produces an [`Artifact`] from a typed source configuration.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Short label for logs (`configstore`, `versioncontrol`, `registry`).
    fn kind(&self) -> &'static str;

    /// Retrieve the content into `ctx.dir` and describe it.
    async fn fetch(&self, ctx: &FetchContext) -> Result<Artifact, FetchError>;
}

/// Process-wide inputs shared by every fetch.
#[derive(Clone)]
pub struct FetchEnv {
    pub home: PathBuf,
    /// Parent of every per-fetch scratch directory.
    pub work_dir: PathBuf,
    pub credentials: Arc<dyn CredentialLoader>,
}

impl FetchEnv {
    /// Environment reading secrets from `<home>/.arena/secrets`.
    pub fn new(home: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            credentials: Arc::new(FsCredentialLoader::new(home.clone())),
            home,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialLoader>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Context for one fetch of `key`, with a fresh, not yet created,
    /// scratch directory `<work_dir>/<namespace>/<name>/<uuid>`.
    pub fn context(&self, key: &SourceKey) -> FetchContext {
        let dir = self
            .work_dir
            .join(&key.namespace.0)
            .join(&key.name.0)
            .join(uuid::Uuid::new_v4().to_string());
        FetchContext {
            key: key.clone(),
            home: self.home.clone(),
            dir,
            credentials: Arc::clone(&self.credentials),
        }
    }
}

impl fmt::Debug for FetchEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchEnv")
            .field("home", &self.home)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

/// Inputs for a single fetch.
#[derive(Clone)]
pub struct FetchContext {
    pub key: SourceKey,
    pub home: PathBuf,
    /// Scratch directory owned by this fetch. The caller removes it.
    pub dir: PathBuf,
    pub credentials: Arc<dyn CredentialLoader>,
}

impl FetchContext {
    pub fn namespace(&self) -> &str {
        &self.key.namespace.0
    }

    /// `<dir>/content`, where fetchers place the tree they publish.
    pub fn content_dir(&self) -> PathBuf {
        self.dir.join("content")
    }

    pub(crate) async fn prepare(&self) -> Result<(), FetchError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))
    }
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("key", &self.key)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Check that `spec` names a supported type and carries its payload.
pub fn validate_source(spec: &TemplateSourceSpec) -> Result<(), ConfigError> {
    match &spec.source_type {
        SourceType::ConfigStore => {
            let cfg = required(spec.config_store.as_ref(), &spec.source_type, "config_store")?;
            non_empty(&cfg.name, "config_store.name")
        }
        SourceType::VersionControl => {
            let cfg = required(
                spec.version_control.as_ref(),
                &spec.source_type,
                "version_control",
            )?;
            non_empty(&cfg.url, "version_control.url")
        }
        SourceType::Registry => {
            let cfg = required(spec.registry.as_ref(), &spec.source_type, "registry")?;
            non_empty(&cfg.url, "registry.url")
        }
        SourceType::Unrecognized(other) => Err(ConfigError::UnsupportedSourceType(other.clone())),
    }
}

/// Build the fetcher for `spec`. Fails exactly when [`validate_source`] does.
pub fn select_fetcher(
    spec: &TemplateSourceSpec,
    env: &FetchEnv,
) -> Result<Box<dyn Fetcher>, ConfigError> {
    validate_source(spec)?;
    let fetcher: Box<dyn Fetcher> = match &spec.source_type {
        SourceType::ConfigStore => {
            let cfg = required(spec.config_store.as_ref(), &spec.source_type, "config_store")?;
            Box::new(ConfigStoreFetcher::new(cfg.clone()))
        }
        SourceType::VersionControl => {
            let cfg = required(
                spec.version_control.as_ref(),
                &spec.source_type,
                "version_control",
            )?;
            Box::new(GitFetcher::new(cfg.clone()))
        }
        SourceType::Registry => {
            let cfg = required(spec.registry.as_ref(), &spec.source_type, "registry")?;
            Box::new(RegistryFetcher::new(cfg.clone()))
        }
        SourceType::Unrecognized(other) => {
            return Err(ConfigError::UnsupportedSourceType(other.clone()))
        }
    };
    tracing::trace!(kind = fetcher.kind(), work_dir = %env.work_dir.display(), "selected fetcher");
    Ok(fetcher)
}

fn required<'a, T>(
    payload: Option<&'a T>,
    source_type: &SourceType,
    field: &'static str,
) -> Result<&'a T, ConfigError> {
    payload.ok_or_else(|| ConfigError::MissingSourceConfig {
        source_type: source_type.to_string(),
        field,
    })
}

fn non_empty(value: &str, field: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::EmptyField { field })
    } else {
        Ok(())
    }
}

/// Resolve a user-supplied relative path below `base`, rejecting absolute
/// paths and `..` components.
pub(crate) fn safe_join(base: &Path, relative: &str) -> Result<PathBuf, FetchError> {
    use std::path::Component;

    let unsafe_path = || FetchError::UnsafePath {
        path: relative.to_string(),
    };
    let rel = Path::new(relative);
    if relative.starts_with('/') || rel.is_absolute() {
        return Err(unsafe_path());
    }
    let mut out = base.to_path_buf();
    let mut pushed = false;
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            _ => return Err(unsafe_path()),
        }
    }
    if !pushed {
        return Err(unsafe_path());
    }
    Ok(out)
}

/// Total bytes of regular files below `root`.
pub(crate) async fn tree_size(root: &Path) -> Result<u64, FetchError> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_err(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
            let ty = entry.file_type().await.map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                pending.push(entry.path());
            } else if ty.is_file() {
                let meta = entry.metadata().await.map_err(|e| io_err(entry.path(), e))?;
                total += meta.len();
            }
        }
    }
    Ok(total)
}
