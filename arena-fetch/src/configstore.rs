//! Config-store origin: a key/value document materialised as a file tree.
//!
//! `<home>/.arena/configstores/<namespace>/<name>.yaml`:
//!
//! ```yaml
//! revision: "42"          # optional
//! data:
//!   chat/template.yaml: |
//!     name: chat
//!   chat/prompt.md: Hello
//! ```
//!
//! Each key is a relative file path. With a `key_prefix`, only keys carrying
//! the prefix are written, with the prefix stripped. The checksum is a SHA-256
//! over the selected keys and values in key order, so identical data always
//! produces the same version.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use arena_core::config::arena_root;
use arena_core::types::{Artifact, ConfigStoreSource};

use crate::error::{io_err, FetchError};
use crate::fetcher::{safe_join, FetchContext, Fetcher};

/// `<home>/.arena/configstores/<namespace>/<name>.yaml`
pub fn config_store_path_at(home: &Path, namespace: &str, name: &str) -> PathBuf {
    arena_root(home)
        .join("configstores")
        .join(namespace)
        .join(format!("{name}.yaml"))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigStoreDocument {
    #[serde(default)]
    revision: Option<String>,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ConfigStoreFetcher {
    source: ConfigStoreSource,
}

impl ConfigStoreFetcher {
    pub fn new(source: ConfigStoreSource) -> Self {
        Self { source }
    }

    fn select<'a>(&self, data: &'a BTreeMap<String, String>) -> Vec<(&'a str, &'a str)> {
        let prefix = self.source.key_prefix.as_deref().unwrap_or("");
        data.iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest, v.as_str()))
            })
            .collect()
    }
}

#[async_trait]
impl Fetcher for ConfigStoreFetcher {
    fn kind(&self) -> &'static str {
        "configstore"
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Artifact, FetchError> {
        let path = config_store_path_at(&ctx.home, ctx.namespace(), &self.source.name);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound {
                    kind: "config store",
                    name: format!("{}/{}", ctx.namespace(), self.source.name),
                    path,
                })
            }
            Err(err) => return Err(io_err(&path, err)),
        };
        let doc: ConfigStoreDocument = if contents.trim().is_empty() {
            ConfigStoreDocument::default()
        } else {
            serde_yaml::from_str(&contents).map_err(|e| FetchError::Document {
                path: path.clone(),
                message: e.to_string(),
            })?
        };

        let entries = self.select(&doc.data);
        let content = ctx.content_dir();
        tokio::fs::create_dir_all(&content)
            .await
            .map_err(|e| io_err(&content, e))?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        for (key, value) in &entries {
            let dest = safe_join(&content, key)?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_err(parent, e))?;
            }
            tokio::fs::write(&dest, value.as_bytes())
                .await
                .map_err(|e| io_err(&dest, e))?;

            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
            size += value.len() as u64;
        }
        let digest = hex::encode(hasher.finalize());

        let revision = doc
            .revision
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| digest[..12].to_string());
        tracing::debug!(
            source = %ctx.key,
            files = entries.len(),
            %revision,
            "materialised config store"
        );

        Ok(Artifact {
            path: content,
            checksum: format!("sha256:{digest}"),
            revision: format!("{}@{revision}", self.source.name),
            size,
        })
    }
}
