//! Version-control origin, via the `git` command line.
//!
//! A shallow checkout lands in `<ctx.dir>/content`. The `.git` directory is
//! removed before the tree is published, so the stored content depends only
//! on the checked-out files. The checksum carries the commit id under a
//! non-`sha256` algorithm, which makes the store version the tree by content.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::process::Command;

use arena_core::types::{Artifact, VersionControlSource};

use crate::credentials::{CredentialKind, Credentials};
use crate::error::{io_err, FetchError};
use crate::fetcher::{safe_join, tree_size, FetchContext, Fetcher};

#[derive(Debug, Clone)]
pub struct GitFetcher {
    source: VersionControlSource,
}

impl GitFetcher {
    pub fn new(source: VersionControlSource) -> Self {
        Self { source }
    }

    /// Human-readable name of the requested revision.
    fn reference_name(&self) -> String {
        let r = &self.source.reference;
        if let Some(commit) = r.commit.as_deref() {
            return commit.to_string();
        }
        if let Some(tag) = r.tag.as_deref() {
            return format!("refs/tags/{tag}");
        }
        match r.branch.as_deref() {
            Some(branch) => format!("refs/heads/{branch}"),
            None => "HEAD".to_string(),
        }
    }

    async fn checkout(&self, ctx: &FetchContext, auth: &GitAuth, dest: &Path) -> Result<(), FetchError> {
        let url = self.source.url.as_str();
        let dest_str = dest.to_string_lossy().into_owned();
        let r = &self.source.reference;

        if let Some(commit) = r.commit.as_deref() {
            run_git(auth, None, &["init", "--quiet", &dest_str]).await?;
            run_git(auth, Some(dest), &["remote", "add", "origin", url]).await?;
            run_git(auth, Some(dest), &["fetch", "--quiet", "--depth", "1", "origin", commit]).await?;
            run_git(auth, Some(dest), &["checkout", "--quiet", "FETCH_HEAD"]).await?;
        } else {
            let mut args = vec!["clone", "--quiet", "--depth", "1"];
            if let Some(name) = r.tag.as_deref().or(r.branch.as_deref()) {
                args.extend(["--branch", name]);
            }
            args.extend([url, dest_str.as_str()]);
            run_git(auth, Some(&ctx.dir), &args).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for GitFetcher {
    fn kind(&self) -> &'static str {
        "versioncontrol"
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Artifact, FetchError> {
        ctx.prepare().await?;

        let credentials = match &self.source.secret_ref {
            Some(secret) => {
                ctx.credentials
                    .load(ctx.namespace(), secret, CredentialKind::VersionControl)?
            }
            None => Credentials::default(),
        };
        let auth = GitAuth::prepare(ctx, &credentials).await?;

        let checkout = ctx.dir.join("checkout");
        self.checkout(ctx, &auth, &checkout).await?;
        let commit = run_git(&auth, Some(&checkout), &["rev-parse", "HEAD"]).await?;
        let commit = commit.trim().to_string();

        let git_dir = checkout.join(".git");
        tokio::fs::remove_dir_all(&git_dir)
            .await
            .map_err(|e| io_err(&git_dir, e))?;

        let published = match self.source.path.as_deref().map(str::trim) {
            Some(sub) if !sub.is_empty() && sub != "." => safe_join(&checkout, sub)?,
            _ => checkout,
        };
        if !tokio::fs::metadata(&published)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(FetchError::NotFound {
                kind: "path",
                name: self.source.path.clone().unwrap_or_default(),
                path: published,
            });
        }
        let content = ctx.content_dir();
        tokio::fs::rename(&published, &content)
            .await
            .map_err(|e| io_err(&published, e))?;

        let size = tree_size(&content).await?;
        tracing::debug!(source = %ctx.key, %commit, size, "checked out repository");

        Ok(Artifact {
            path: content,
            checksum: format!("sha1:{commit}"),
            revision: format!("{}@sha1:{commit}", self.reference_name()),
            size,
        })
    }
}

// ---------------------------------------------------------------------------
// Authentication and process helpers
// ---------------------------------------------------------------------------

/// Extra configuration and environment handed to every `git` invocation.
#[derive(Debug, Default)]
struct GitAuth {
    config: Vec<String>,
    env: Vec<(&'static str, String)>,
}

impl GitAuth {
    async fn prepare(ctx: &FetchContext, creds: &Credentials) -> Result<Self, FetchError> {
        let mut auth = GitAuth::default();
        auth.env.push(("GIT_TERMINAL_PROMPT", "0".to_string()));

        if creds.has_basic_auth() {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", creds.username, creds.password));
            auth.config
                .push(format!("http.extraHeader=Authorization: Basic {token}"));
        }

        if !creds.private_key.is_empty() {
            let key = ctx.dir.join("identity");
            write_private(&key, creds.private_key.as_bytes()).await?;
            let mut ssh = format!("ssh -i {} -o IdentitiesOnly=yes", key.display());
            if creds.known_hosts.is_empty() {
                ssh.push_str(" -o StrictHostKeyChecking=accept-new");
            } else {
                let hosts = ctx.dir.join("known_hosts");
                write_private(&hosts, creds.known_hosts.as_bytes()).await?;
                ssh.push_str(&format!(
                    " -o UserKnownHostsFile={} -o StrictHostKeyChecking=yes",
                    hosts.display()
                ));
            }
            auth.env.push(("GIT_SSH_COMMAND", ssh));
        }
        Ok(auth)
    }
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<(), FetchError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| io_err(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| io_err(path, e))?;
    }
    Ok(())
}

/// Run `git` and return its stdout. The child is killed if the future is
/// dropped, so cancelling a fetch stops the transfer.
async fn run_git(auth: &GitAuth, cwd: Option<&Path>, args: &[&str]) -> Result<String, FetchError> {
    let mut cmd = Command::new("git");
    for config in &auth.config {
        cmd.arg("-c").arg(config);
    }
    cmd.args(args)
        .envs(auth.env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|source| FetchError::Spawn {
        program: "git",
        source,
    })?;
    if !output.status.success() {
        return Err(FetchError::Command {
            command: format!("git {}", args.first().copied().unwrap_or_default()),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
