//! Domain types for Arena template sources.
//!
//! Source documents (`metadata` + `spec`) are YAML and use snake_case keys.
//! [`Template`] and its children are published into the JSON index consumed
//! by other services, so they use camelCase keys.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Sync interval applied when a source does not declare one.
pub const DEFAULT_SYNC_INTERVAL: &str = "5m";

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a template source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceName(pub String);

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SourceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SourceName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed tenant namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace(pub String);

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Namespace {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of a source inside the engine: `<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceKey {
    pub namespace: Namespace,
    pub name: SourceName,
}

impl SourceKey {
    pub fn new(namespace: impl Into<Namespace>, name: impl Into<SourceName>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for SourceKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidKey {
            key: s.to_string(),
        };
        let (namespace, name) = s.split_once('/').ok_or_else(invalid)?;
        if !is_valid_segment(namespace) || !is_valid_segment(name) {
            return Err(invalid());
        }
        Ok(Self::new(namespace, name))
    }
}

/// A path segment usable as a directory or file stem.
pub(crate) fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\'])
}

// ---------------------------------------------------------------------------
// Source type
// ---------------------------------------------------------------------------

/// Origin kind of a template source.
///
/// Unknown strings are kept in [`SourceType::Unrecognized`] so that fetcher
/// selection, not deserialization, is the place that rejects them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceType {
    ConfigStore,
    VersionControl,
    Registry,
    Unrecognized(String),
}

impl SourceType {
    pub fn as_str(&self) -> &str {
        match self {
            SourceType::ConfigStore => "configstore",
            SourceType::VersionControl => "versioncontrol",
            SourceType::Registry => "registry",
            SourceType::Unrecognized(other) => other,
        }
    }
}

impl Default for SourceType {
    fn default() -> Self {
        SourceType::Unrecognized(String::new())
    }
}

impl From<String> for SourceType {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "configstore" | "configmap" => SourceType::ConfigStore,
            "versioncontrol" | "git" => SourceType::VersionControl,
            "registry" | "oci" => SourceType::Registry,
            _ => SourceType::Unrecognized(s),
        }
    }
}

impl From<SourceType> for String {
    fn from(t: SourceType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Spec payloads
// ---------------------------------------------------------------------------

/// Reference to a credential bundle in the secret store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
}

/// Config-store origin: a named key/value document in the same namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStoreSource {
    pub name: String,
    /// Only keys starting with this prefix are materialised (prefix stripped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

/// Revision selector for a version-control origin. Commit wins over tag,
/// tag wins over branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GitReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Version-control origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionControlSource {
    pub url: String,
    #[serde(default)]
    pub reference: GitReference,
    /// Sub-directory of the checkout to publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

/// Registry origin: a gzip tarball served over HTTP(S).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySource {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

/// Desired state of a template source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSourceSpec {
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub suspend: bool,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,
    /// Workspace-relative directory receiving the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_store: Option<ConfigStoreSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_control: Option<VersionControlSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySource>,
}

fn default_sync_interval() -> String {
    DEFAULT_SYNC_INTERVAL.to_string()
}

impl Default for TemplateSourceSpec {
    fn default() -> Self {
        Self {
            source_type: SourceType::default(),
            suspend: false,
            sync_interval: default_sync_interval(),
            target_path: None,
            config_store: None,
            version_control: None,
            registry: None,
        }
    }
}

/// Identity and generation of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: SourceName,
    pub namespace: Namespace,
    /// Owning workspace; the namespace is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default = "default_generation")]
    pub generation: i64,
}

fn default_generation() -> i64 {
    1
}

/// A user-declared template source with its engine-owned status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaTemplateSource {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TemplateSourceSpec,
    /// Persisted separately from the document; see [`crate::store`].
    #[serde(skip)]
    pub status: TemplateSourceStatus,
}

impl ArenaTemplateSource {
    pub fn key(&self) -> SourceKey {
        SourceKey {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    pub fn workspace(&self) -> &str {
        self.metadata
            .workspace
            .as_deref()
            .filter(|w| !w.is_empty())
            .unwrap_or(&self.metadata.namespace.0)
    }

    /// `spec.target_path`, or `templates/<name>` when unset.
    pub fn target_path(&self) -> String {
        match self.spec.target_path.as_deref() {
            Some(path) if !path.trim().is_empty() => path.trim_matches('/').to_string(),
            _ => format!("templates/{}", self.metadata.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle phase of a template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Phase {
    #[default]
    Pending,
    Fetching,
    Ready,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Fetching => write!(f, "Fetching"),
            Phase::Ready => write!(f, "Ready"),
            Phase::Error => write!(f, "Error"),
        }
    }
}

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A typed, reason-coded status entry. Unique per `condition_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
}

/// Where the last successfully synced artifact landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStatus {
    pub revision: String,
    pub checksum: String,
    pub version: String,
    pub content_path: String,
    pub size: u64,
    pub last_update_time: DateTime<Utc>,
}

/// Observed state of a template source, owned by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TemplateSourceStatus {
    /// `None` until the first reconciliation observes the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetch_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TemplateSourceStatus {
    /// Current phase; an unobserved source reports `Pending`.
    pub fn phase(&self) -> Phase {
        self.phase.unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Artifact and template metadata
// ---------------------------------------------------------------------------

/// Content fetched from an origin, waiting to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Local directory holding the fetched tree.
    pub path: PathBuf,
    /// `"<algo>:<hex>"`, or empty when the origin provides none.
    pub checksum: String,
    pub revision: String,
    pub size: u64,
}

/// A variable a template expects to be filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_variable_type")]
    pub var_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

fn default_variable_type() -> String {
    "string".to_string()
}

/// A file shipped with a template, relative to the template directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateFile {
    pub path: String,
    #[serde(default)]
    pub size: u64,
}

/// Parsed template metadata, as published in the index and in status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub files: Vec<TemplateFile>,
    /// Template directory, relative to the content root.
    #[serde(default)]
    pub path: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(SourceName::from("starter").to_string(), "starter");
        assert_eq!(Namespace::from("team-a").to_string(), "team-a");
        assert_eq!(SourceKey::new("team-a", "starter").to_string(), "team-a/starter");
    }

    #[test]
    fn source_key_parse() {
        let key: SourceKey = "team-a/starter".parse().expect("parse");
        assert_eq!(key, SourceKey::new("team-a", "starter"));
        assert!("no-slash".parse::<SourceKey>().is_err());
        assert!("a/b/c".parse::<SourceKey>().is_err());
        assert!("../x".parse::<SourceKey>().is_err());
        assert!("/x".parse::<SourceKey>().is_err());
    }

    #[test]
    fn source_type_aliases_and_unknowns() {
        assert_eq!(SourceType::from("git".to_string()), SourceType::VersionControl);
        assert_eq!(SourceType::from("ConfigMap".to_string()), SourceType::ConfigStore);
        assert_eq!(SourceType::from("oci".to_string()), SourceType::Registry);
        assert_eq!(
            SourceType::from("ftp".to_string()),
            SourceType::Unrecognized("ftp".to_string())
        );
    }

    #[test]
    fn minimal_document_applies_defaults() {
        let yaml = "metadata:\n  name: starter\n  namespace: team-a\nspec:\n  source_type: configstore\n  config_store:\n    name: starter\n";
        let source: ArenaTemplateSource = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(source.metadata.generation, 1);
        assert_eq!(source.spec.sync_interval, DEFAULT_SYNC_INTERVAL);
        assert!(!source.spec.suspend);
        assert_eq!(source.workspace(), "team-a");
        assert_eq!(source.target_path(), "templates/starter");
        assert_eq!(source.status.phase(), Phase::Pending);
    }

    #[test]
    fn unknown_source_type_survives_deserialization() {
        let yaml = "metadata:\n  name: s\n  namespace: n\nspec:\n  source_type: carrier-pigeon\n";
        let source: ArenaTemplateSource = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(
            source.spec.source_type,
            SourceType::Unrecognized("carrier-pigeon".to_string())
        );
    }

    #[test]
    fn template_uses_camel_case_keys() {
        let template = Template {
            name: "chat".to_string(),
            version: "1.0.0".to_string(),
            display_name: "Chat".to_string(),
            description: String::new(),
            category: "agents".to_string(),
            tags: vec![],
            variables: vec![],
            files: vec![],
            path: "chat".to_string(),
        };
        let json = serde_json::to_value(&template).expect("serialize");
        assert_eq!(json["displayName"], "Chat");
        assert!(json.get("display_name").is_none());
    }

    #[test]
    fn explicit_target_path_is_trimmed() {
        let yaml = "metadata:\n  name: s\n  namespace: n\n  workspace: acme\nspec:\n  source_type: registry\n  target_path: /shared/templates/\n";
        let source: ArenaTemplateSource = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(source.target_path(), "shared/templates");
        assert_eq!(source.workspace(), "acme");
    }
}
