//! `arena gc <root>` — apply version retention to one target directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use arena_core::config;

#[derive(Args, Debug)]
pub struct GcArgs {
    /// Target directory holding `.arena/versions`.
    pub root: PathBuf,

    /// Versions to keep. Defaults to `max_versions` from the engine config;
    /// 0 means the built-in default of 10.
    #[arg(long)]
    pub max_versions: Option<usize>,
}

impl GcArgs {
    pub fn run(self) -> Result<()> {
        let max_versions = match self.max_versions {
            Some(n) => n,
            None => {
                let home = crate::home()?;
                config::load_at(&home)
                    .context("failed to load engine config")?
                    .max_versions
            }
        };

        let report = arena_sync::gc(&self.root, max_versions)
            .with_context(|| format!("gc failed for {}", self.root.display()))?;

        if report.removed.is_empty() {
            println!(
                "✓ nothing to collect in {} ({} retained)",
                self.root.display(),
                report.retained
            );
            return Ok(());
        }

        println!(
            "✓ removed {} version(s) from {} ({} retained)",
            report.removed.len(),
            self.root.display(),
            report.retained
        );
        for version in &report.removed {
            println!("  ✗  {version}");
        }
        Ok(())
    }
}
