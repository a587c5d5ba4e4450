//! Arena core library — domain types, conditions, config, source store.
//!
//! - [`types`] — template source model, status, artifacts, template metadata
//! - [`conditions`] — typed condition bookkeeping and stable reasons
//! - [`duration`] — sync interval parsing
//! - [`config`] — engine configuration
//! - [`store`] — source document persistence
//! - [`error`] — [`StoreError`], [`ConfigError`]

pub mod conditions;
pub mod config;
pub mod duration;
pub mod error;
pub mod store;
pub mod types;

pub use config::EngineConfig;
pub use error::{ConfigError, StoreError};
pub use store::{FsSourceStore, SourceStore};
pub use types::{
    ArenaTemplateSource, Artifact, ArtifactStatus, Condition, ConditionStatus, Namespace,
    ObjectMeta, Phase, SourceKey, SourceName, SourceType, Template, TemplateFile,
    TemplateSourceSpec, TemplateSourceStatus, TemplateVariable,
};
