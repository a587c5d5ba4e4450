//! `arena reconcile <namespace>/<name>` — one source, in-process.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use arena_core::conditions::{find_condition, CONDITION_READY};
use arena_core::config;
use arena_core::store::load_source_at;
use arena_core::types::Phase;
use arena_daemon::{Reconciler, TracingEventRecorder};

use super::parse_key;

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Source to reconcile, as `<namespace>/<name>`.
    pub source: String,
}

impl ReconcileArgs {
    pub fn run(self) -> Result<()> {
        let home = crate::home()?;
        let key = parse_key(&self.source)?;
        if load_source_at(&home, &key)
            .with_context(|| format!("failed to load source '{key}'"))?
            .is_none()
        {
            bail!("source '{key}' not found");
        }
        let config = config::load_at(&home).context("failed to load engine config")?;
        // Slack on top of the fetch timeout for discovery and the store.
        let wait = config.fetch_timeout() + Duration::from_secs(30);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;

        runtime.block_on(async {
            let (reconciler, mut completed) = Reconciler::from_config(&home, &config);
            let reconciler = reconciler.with_recorder(std::sync::Arc::new(TracingEventRecorder));

            loop {
                reconciler
                    .reconcile(&key)
                    .await
                    .with_context(|| format!("reconcile failed for '{key}'"))?;
                if !reconciler.has_outstanding_fetch(&key) {
                    break;
                }
                tracing::debug!(source = %key, "waiting for fetch to complete");
                tokio::time::timeout(wait, completed.recv())
                    .await
                    .with_context(|| format!("timed out waiting for the fetch of '{key}'"))?
                    .context("fetch task ended without reporting")?;
            }
            Ok::<_, anyhow::Error>(())
        })?;

        let source = load_source_at(&home, &key)
            .with_context(|| format!("failed to reload source '{key}'"))?
            .with_context(|| format!("source '{key}' disappeared during reconcile"))?;
        let status = &source.status;
        let ready = find_condition(&status.conditions, CONDITION_READY);
        let reason = ready.map(|c| c.reason.as_str()).unwrap_or("-");

        match status.phase() {
            Phase::Ready => {
                println!(
                    "{} '{key}' {} version {} ({} template(s))",
                    "✓".green().bold(),
                    "Ready".green(),
                    status.head_version.as_deref().unwrap_or("-"),
                    status.templates.len()
                );
                for template in &status.templates {
                    println!("  ·  {} ({})", template.name, template.path);
                }
                Ok(())
            }
            Phase::Error => {
                let message = ready.map(|c| c.message.as_str()).unwrap_or_default();
                bail!("'{key}' is in Error ({reason}): {message}")
            }
            phase => {
                println!("{} '{key}' {phase} ({reason})", "·".bright_black());
                Ok(())
            }
        }
    }
}
