//! # arena-fetch
//!
//! Origins that produce [`Artifact`](arena_core::types::Artifact)s for the
//! content store.
//!
//! - [`fetcher`] — the [`Fetcher`] trait, fetch contexts, [`select_fetcher`]
//! - [`configstore`] — local key/value documents
//! - [`git`] — version control through the `git` CLI
//! - [`registry`] — gzip tarballs over HTTP(S)
//! - [`credentials`] — secret lookup for authenticated origins

pub mod configstore;
pub mod credentials;
pub mod error;
pub mod fetcher;
pub mod git;
pub mod registry;

pub use credentials::{CredentialKind, CredentialLoader, Credentials, FsCredentialLoader};
pub use error::FetchError;
pub use fetcher::{select_fetcher, validate_source, FetchContext, FetchEnv, Fetcher};
