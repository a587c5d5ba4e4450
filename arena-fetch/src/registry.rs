//! Registry origin: a gzip-compressed tarball fetched over HTTP(S).
//!
//! `file://` URLs are read from the local filesystem, which is how mirrored
//! bundles and tests are served. The checksum is the SHA-256 of the archive
//! bytes, so re-downloading an unchanged bundle yields the same version.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use arena_core::types::{Artifact, RegistrySource};

use crate::credentials::{CredentialKind, Credentials};
use crate::error::{io_err, FetchError};
use crate::fetcher::{tree_size, FetchContext, Fetcher};

/// Largest archive accepted, compressed.
pub const MAX_ARCHIVE_BYTES: u64 = 256 * 1024 * 1024;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RegistryFetcher {
    source: RegistrySource,
}

impl RegistryFetcher {
    pub fn new(source: RegistrySource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    fn kind(&self) -> &'static str {
        "registry"
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Artifact, FetchError> {
        ctx.prepare().await?;

        let credentials = match &self.source.secret_ref {
            Some(secret) => ctx
                .credentials
                .load(ctx.namespace(), secret, CredentialKind::Registry)?,
            None => Credentials::default(),
        };
        let url = self.source.url.clone();
        let authorization = authorization_for(&url, &credentials);
        let content = ctx.content_dir();

        let dest = content.clone();
        let (digest, etag) = tokio::task::spawn_blocking(move || {
            let (bytes, etag) = download(&url, authorization.as_deref())?;
            let digest = hex::encode(Sha256::digest(&bytes));
            unpack(&url, &bytes, &dest)?;
            Ok::<_, FetchError>((digest, etag))
        })
        .await
        .map_err(|e| FetchError::Task(e.to_string()))??;

        let size = tree_size(&content).await?;
        let revision = match etag {
            Some(tag) => format!("{}@{}", self.source.url, tag.trim_matches('"')),
            None => format!("{}@sha256:{}", self.source.url, &digest[..12]),
        };
        tracing::debug!(source = %ctx.key, %revision, size, "unpacked registry bundle");

        Ok(Artifact {
            path: content,
            checksum: format!("sha256:{digest}"),
            revision,
            size,
        })
    }
}

/// Read the archive bytes and, for HTTP, the `ETag` header.
fn download(url: &str, authorization: Option<&str>) -> Result<(Vec<u8>, Option<String>), FetchError> {
    if let Some(path) = url.strip_prefix("file://") {
        let path = PathBuf::from(path);
        let meta = std::fs::metadata(&path).map_err(|e| io_err(&path, e))?;
        if meta.len() > MAX_ARCHIVE_BYTES {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                limit: MAX_ARCHIVE_BYTES,
            });
        }
        let bytes = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
        return Ok((bytes, None));
    }

    let mut request = ureq::get(url).timeout(HTTP_TIMEOUT);
    if let Some(value) = authorization {
        request = request.set("Authorization", value);
    }
    let response = request.call().map_err(|e| FetchError::Http {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    let etag = response.header("etag").map(str::to_string);

    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_ARCHIVE_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| FetchError::Http {
            url: url.to_string(),
            message: e.to_string(),
        })?;
    if bytes.len() as u64 > MAX_ARCHIVE_BYTES {
        return Err(FetchError::TooLarge {
            url: url.to_string(),
            limit: MAX_ARCHIVE_BYTES,
        });
    }
    Ok((bytes, etag))
}

/// Extract a gzip tarball into `dest`. Entries escaping `dest` abort the
/// extraction.
fn unpack(url: &str, bytes: &[u8], dest: &Path) -> Result<(), FetchError> {
    let archive_err = |e: std::io::Error| FetchError::Archive {
        url: url.to_string(),
        message: e.to_string(),
    };
    std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let name = entry
            .path()
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(archive_err)?;
        if !entry.unpack_in(dest).map_err(archive_err)? {
            return Err(FetchError::UnsafePath { path: name });
        }
    }
    Ok(())
}

/// `Authorization` header for `url`: explicit username/password first, then a
/// matching entry of the Docker config blob.
fn authorization_for(url: &str, creds: &Credentials) -> Option<String> {
    let engine = base64::engine::general_purpose::STANDARD;
    if creds.has_basic_auth() {
        let token = engine.encode(format!("{}:{}", creds.username, creds.password));
        return Some(format!("Basic {token}"));
    }
    if creds.docker_config.trim().is_empty() {
        return None;
    }

    let config: serde_json::Value = match serde_json::from_str(&creds.docker_config) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring malformed docker config in secret");
            return None;
        }
    };
    let host = host_of(url)?;
    let auths = config.get("auths")?.as_object()?;
    let entry = auths
        .iter()
        .find(|(registry, _)| host_of(registry).unwrap_or(registry.as_str()) == host)
        .map(|(_, entry)| entry)?;

    if let Some(auth) = entry.get("auth").and_then(|a| a.as_str()).filter(|a| !a.is_empty()) {
        return Some(format!("Basic {auth}"));
    }
    let user = entry.get("username").and_then(|u| u.as_str()).unwrap_or_default();
    let pass = entry.get("password").and_then(|p| p.as_str()).unwrap_or_default();
    if user.is_empty() && pass.is_empty() {
        return None;
    }
    Some(format!("Basic {}", engine.encode(format!("{user}:{pass}"))))
}

/// Host (with port) of a URL or bare registry name.
fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit_once('@').map_or(host, |(_, h)| h);
    (!host.is_empty()).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://registry.example.com:5000/a/b.tgz"), Some("registry.example.com:5000"));
        assert_eq!(host_of("registry.example.com"), Some("registry.example.com"));
        assert_eq!(host_of("https://user@host/x"), Some("host"));
        assert_eq!(host_of("file:///tmp/x.tgz"), None);
    }

    #[test]
    fn explicit_credentials_win() {
        let creds = Credentials {
            username: "bot".into(),
            password: "pw".into(),
            docker_config: r#"{"auths":{"h":{"auth":"ignored"}}}"#.into(),
            ..Credentials::default()
        };
        assert_eq!(
            authorization_for("https://h/x.tgz", &creds).as_deref(),
            Some("Basic Ym90OnB3")
        );
    }

    #[test]
    fn docker_config_matches_host() {
        let creds = Credentials {
            docker_config: r#"{"auths":{"https://reg.example.com":{"auth":"dXNlcjpwYXNz"},"other":{"auth":"bm9wZQ=="}}}"#.into(),
            ..Credentials::default()
        };
        assert_eq!(
            authorization_for("https://reg.example.com/bundles/t.tgz", &creds).as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );
        assert_eq!(authorization_for("https://unknown.example.com/t.tgz", &creds), None);
    }

    #[test]
    fn malformed_docker_config_is_ignored() {
        let creds = Credentials {
            docker_config: "{not json".into(),
            ..Credentials::default()
        };
        assert_eq!(authorization_for("https://h/x", &creds), None);
    }
}
