//! # arena-sync
//!
//! Content-addressed storage for fetched template artifacts.
//!
//! - [`version`] — derive the 12-hex version of an artifact
//! - [`store`] — [`ContentStore`]: dedup, relocate, advance `HEAD`
//! - [`gc`] — retention of version directories
//! - [`index`] — [`TemplateIndexer`]: per-source JSON index
//! - [`writer`] — atomic writes and tree copies

pub mod error;
pub mod gc;
pub mod index;
pub mod store;
pub mod version;
pub mod writer;

pub use error::SyncError;
pub use gc::{gc, gc_keeping, GcReport};
pub use index::TemplateIndexer;
pub use store::{ContentStore, SyncedVersion};
pub use version::compute_version;
