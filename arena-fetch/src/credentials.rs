//! Credential bundles for authenticated origins.
//!
//! Secrets live at `<home>/.arena/secrets/<namespace>/<name>.yaml`:
//!
//! ```yaml
//! data:
//!   username: deploy
//!   password: s3cret
//! ```
//!
//! Recognised keys depend on the origin kind. Keys that are absent leave the
//! matching field empty; only a missing or unreadable secret is an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use arena_core::config::arena_root;
use arena_core::types::SecretRef;
use serde::Deserialize;

use crate::error::{io_err, FetchError};

/// Which origin the credentials are for; decides which keys are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    VersionControl,
    Registry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// PEM private key (version control over SSH).
    pub private_key: String,
    pub known_hosts: String,
    /// Raw `config.json` in Docker format (registries).
    pub docker_config: String,
}

impl Credentials {
    pub fn has_basic_auth(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

/// Resolves a secret reference into a credential bundle.
pub trait CredentialLoader: Send + Sync {
    fn load(
        &self,
        namespace: &str,
        secret: &SecretRef,
        kind: CredentialKind,
    ) -> Result<Credentials, FetchError>;
}

/// [`CredentialLoader`] backed by YAML files under `<home>/.arena/secrets`.
#[derive(Debug, Clone)]
pub struct FsCredentialLoader {
    home: PathBuf,
}

impl FsCredentialLoader {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }
}

/// `<home>/.arena/secrets/<namespace>/<name>.yaml`
pub fn secret_path_at(home: &Path, namespace: &str, name: &str) -> PathBuf {
    arena_root(home)
        .join("secrets")
        .join(namespace)
        .join(format!("{name}.yaml"))
}

#[derive(Debug, Default, Deserialize)]
struct SecretDocument {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl CredentialLoader for FsCredentialLoader {
    fn load(
        &self,
        namespace: &str,
        secret: &SecretRef,
        kind: CredentialKind,
    ) -> Result<Credentials, FetchError> {
        let path = secret_path_at(&self.home, namespace, &secret.name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound {
                    kind: "secret",
                    name: format!("{namespace}/{}", secret.name),
                    path,
                })
            }
            Err(err) => return Err(io_err(&path, err)),
        };
        let doc: SecretDocument = if contents.trim().is_empty() {
            SecretDocument::default()
        } else {
            serde_yaml::from_str(&contents).map_err(|e| FetchError::Document {
                path: path.clone(),
                message: e.to_string(),
            })?
        };
        Ok(from_data(&doc.data, kind))
    }
}

/// Project a secret's key/value data onto [`Credentials`].
pub fn from_data(data: &BTreeMap<String, String>, kind: CredentialKind) -> Credentials {
    let get = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| data.get(*k))
            .cloned()
            .unwrap_or_default()
    };

    let mut creds = Credentials {
        username: get(&["username"]),
        password: get(&["password"]),
        ..Credentials::default()
    };
    match kind {
        CredentialKind::VersionControl => {
            creds.private_key = get(&["identity", "ssh-privatekey"]);
            creds.known_hosts = get(&["known_hosts"]);
        }
        CredentialKind::Registry => {
            creds.docker_config = get(&[".dockerconfigjson", "config.json"]);
        }
    }
    creds
}
