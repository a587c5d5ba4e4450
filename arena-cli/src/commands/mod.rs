pub mod daemon;
pub mod gc;
pub mod reconcile;
pub mod source;
pub mod status;

use anyhow::{Context, Result};
use arena_core::types::SourceKey;

/// Parse a `<namespace>/<name>` argument.
pub(crate) fn parse_key(value: &str) -> Result<SourceKey> {
    value
        .parse::<SourceKey>()
        .with_context(|| format!("invalid source '{value}'"))
}
