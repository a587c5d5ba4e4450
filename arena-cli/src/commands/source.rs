//! `arena source list` and `arena source delete <namespace>/<name>`

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use arena_core::conditions::{is_condition_true, CONDITION_READY};
use arena_core::config;
use arena_core::store::{delete_source_at, list_sources_at, load_source_at};
use arena_core::types::ArenaTemplateSource;
use arena_sync::{ContentStore, TemplateIndexer};

use super::parse_key;

#[derive(Subcommand, Debug)]
pub enum SourceCommand {
    /// List every template source.
    List(ListArgs),

    /// Remove a source document and its status.
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Source to delete, as `<namespace>/<name>`.
    pub source: String,

    /// Also remove stored versions and the template index.
    #[arg(long)]
    pub purge: bool,
}

pub fn run(cmd: SourceCommand) -> Result<()> {
    match cmd {
        SourceCommand::List(args) => list(args),
        SourceCommand::Delete(args) => delete(args),
    }
}

#[derive(Serialize)]
struct SourceJson {
    source: String,
    #[serde(rename = "type")]
    source_type: String,
    workspace: String,
    target_path: String,
    sync_interval: String,
    suspended: bool,
    generation: i64,
    phase: String,
    ready: bool,
    head_version: Option<String>,
    templates: usize,
}

impl From<&ArenaTemplateSource> for SourceJson {
    fn from(source: &ArenaTemplateSource) -> Self {
        Self {
            source: source.key().to_string(),
            source_type: source.spec.source_type.to_string(),
            workspace: source.workspace().to_string(),
            target_path: source.target_path(),
            sync_interval: source.spec.sync_interval.clone(),
            suspended: source.spec.suspend,
            generation: source.metadata.generation,
            phase: source.status.phase().to_string(),
            ready: is_condition_true(&source.status.conditions, CONDITION_READY),
            head_version: source.status.head_version.clone(),
            templates: source.status.templates.len(),
        }
    }
}

#[derive(Tabled)]
struct SourceRow {
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "type")]
    source_type: String,
    #[tabled(rename = "interval")]
    interval: String,
    #[tabled(rename = "target")]
    target: String,
    #[tabled(rename = "suspended")]
    suspended: String,
}

fn list(args: ListArgs) -> Result<()> {
    let home = crate::home()?;
    let sources = list_sources_at(&home).context("failed to list template sources")?;

    if args.json {
        let payload: Vec<SourceJson> = sources.iter().map(SourceJson::from).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize sources JSON")?
        );
        return Ok(());
    }

    if sources.is_empty() {
        println!("No template sources found.");
        println!("Add one under ~/.arena/sources/<namespace>/<name>.yaml");
        return Ok(());
    }

    let rows: Vec<SourceRow> = sources
        .iter()
        .map(|source| SourceRow {
            source: source.key().to_string(),
            source_type: source.spec.source_type.to_string(),
            interval: source.spec.sync_interval.clone(),
            target: format!("{}/{}", source.workspace(), source.target_path()),
            suspended: if source.spec.suspend { "yes" } else { "" }.to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn delete(args: DeleteArgs) -> Result<()> {
    let home = crate::home()?;
    let key = parse_key(&args.source)?;

    let Some(source) = load_source_at(&home, &key)
        .with_context(|| format!("failed to load source '{key}'"))?
    else {
        bail!("source '{key}' not found");
    };

    delete_source_at(&home, &key).with_context(|| format!("failed to delete source '{key}'"))?;
    println!("✓ Deleted source '{key}'");

    if !args.purge {
        return Ok(());
    }

    let config = config::load_at(&home).context("failed to load engine config")?;
    let workspace = source.workspace();
    let namespace = key.namespace.0.as_str();
    let target = source.target_path();

    let purged = ContentStore::from_config(&config)
        .purge(workspace, namespace, &target)
        .with_context(|| format!("failed to purge stored versions of '{key}'"))?;
    let unindexed = TemplateIndexer::from_config(&config)
        .remove_index(workspace, namespace, &key.name.0)
        .with_context(|| format!("failed to remove template index of '{key}'"))?;

    if purged {
        println!("  ✗  removed stored versions under {target}");
    }
    if unindexed {
        println!("  ✗  removed template index");
    }
    Ok(())
}
