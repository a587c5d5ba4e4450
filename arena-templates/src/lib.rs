//! Template discovery for fetched content trees.
//!
//! `discover_templates(root)` walks a fetched tree and turns every directory
//! holding a `template.yaml` (or `template.yml`) manifest into a [`Template`].
//! Discovery does not descend into a template directory looking for further
//! manifests, and skips hidden directories such as `.git` and `.arena`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use arena_core::types::{Template, TemplateFile, TemplateVariable};
use serde::Deserialize;
use thiserror::Error;

/// Manifest file names, in lookup order.
pub const MANIFEST_NAMES: [&str; 2] = ["template.yaml", "template.yml"];

/// Directories deeper than this below the root are not searched.
const MAX_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Errors from template discovery. All of them mean the fetched content is
/// malformed; none are retried until the content changes.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid template manifest {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    #[error("template manifest {path} has no name and no directory to name it after")]
    MissingName { path: PathBuf },

    #[error("duplicate template name '{name}' in '{first}' and '{second}'")]
    DuplicateName {
        name: String,
        first: String,
        second: String,
    },
}

/// On-disk shape of a template manifest. Every field except the name is
/// optional; `enabled` defaults to `true` when absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Manifest {
    name: Option<String>,
    version: String,
    #[serde(alias = "display_name")]
    display_name: String,
    description: String,
    category: String,
    tags: Vec<String>,
    variables: Vec<TemplateVariable>,
    enabled: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Discover every enabled template under `root`, sorted by path.
pub fn discover_templates(root: &Path) -> Result<Vec<Template>, ParseError> {
    let mut found = Vec::new();
    walk(root, root, 0, &mut found)?;
    found.sort_by(|a, b| a.path.cmp(&b.path));

    let mut seen: HashMap<String, String> = HashMap::new();
    for template in &found {
        if let Some(first) = seen.insert(template.name.clone(), template.path.clone()) {
            return Err(ParseError::DuplicateName {
                name: template.name.clone(),
                first,
                second: template.path.clone(),
            });
        }
    }
    Ok(found)
}

/// Parse the template rooted at `dir`. Returns `None` when the directory has
/// no manifest or the manifest sets `enabled: false`.
pub fn load_template(root: &Path, dir: &Path) -> Result<Option<Template>, ParseError> {
    let Some(manifest_path) = find_manifest(dir) else {
        return Ok(None);
    };
    let contents = fs::read_to_string(&manifest_path).map_err(|e| io_err(&manifest_path, e))?;
    let manifest: Manifest = if contents.trim().is_empty() {
        Manifest::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ParseError::Manifest {
            path: manifest_path.clone(),
            message: e.to_string(),
        })?
    };

    if manifest.enabled == Some(false) {
        tracing::debug!(path = %dir.display(), "template disabled; skipping");
        return Ok(None);
    }

    let relative = relative_path(root, dir);
    let name = match manifest.name.filter(|n| !n.trim().is_empty()) {
        Some(name) => name,
        None => dir
            .file_name()
            .filter(|_| relative != ".")
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ParseError::MissingName {
                path: manifest_path.clone(),
            })?,
    };

    let mut files = Vec::new();
    list_files(dir, dir, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(Some(Template {
        display_name: if manifest.display_name.is_empty() {
            name.clone()
        } else {
            manifest.display_name
        },
        name,
        version: manifest.version,
        description: manifest.description,
        category: manifest.category,
        tags: manifest.tags,
        variables: manifest.variables,
        files,
        path: relative,
    }))
}

// ---------------------------------------------------------------------------
// Walk helpers
// ---------------------------------------------------------------------------

fn walk(root: &Path, dir: &Path, depth: usize, out: &mut Vec<Template>) -> Result<(), ParseError> {
    if find_manifest(dir).is_some() {
        if let Some(template) = load_template(root, dir)? {
            out.push(template);
        }
        return Ok(());
    }
    if depth >= MAX_DEPTH {
        return Ok(());
    }

    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
        if ty.is_dir() && !is_hidden(&entry.file_name().to_string_lossy()) {
            walk(root, &entry.path(), depth + 1, out)?;
        }
    }
    Ok(())
}

fn list_files(base: &Path, dir: &Path, out: &mut Vec<TemplateFile>) -> Result<(), ParseError> {
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let ty = entry.file_type().map_err(|e| io_err(&path, e))?;
        if ty.is_dir() {
            if !is_hidden(&entry.file_name().to_string_lossy()) {
                list_files(base, &path, out)?;
            }
        } else if ty.is_file() {
            let size = entry.metadata().map_err(|e| io_err(&path, e))?.len();
            out.push(TemplateFile {
                path: relative_path(base, &path),
                size,
            });
        }
    }
    Ok(())
}

fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// `/`-separated path of `path` below `base`; `.` for `base` itself.
fn relative_path(base: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ParseError {
    ParseError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn relative_paths_use_forward_slashes() {
        let base = Path::new("/tmp/fetch");
        assert_eq!(relative_path(base, base), ".");
        assert_eq!(relative_path(base, &base.join("a").join("b.txt")), "a/b.txt");
    }

    #[test]
    fn empty_manifest_is_named_after_directory() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("starter");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("template.yml"), "").unwrap();

        let template = load_template(root.path(), &dir).unwrap().expect("template");
        assert_eq!(template.name, "starter");
        assert_eq!(template.display_name, "starter");
        assert_eq!(template.path, "starter");
    }

    #[test]
    fn unnamed_root_manifest_is_an_error() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("template.yaml"), "version: 1.0.0\n").unwrap();
        let err = load_template(root.path(), root.path()).unwrap_err();
        assert!(matches!(err, ParseError::MissingName { .. }), "got: {err}");
    }
}
