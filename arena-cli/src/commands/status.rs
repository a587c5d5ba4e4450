//! `arena status` — phase and readiness of every source.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use arena_core::conditions::{find_condition, CONDITION_READY};
use arena_core::store::list_sources_at;
use arena_core::types::{ArenaTemplateSource, ConditionStatus, Phase};

/// Arguments for `arena status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = crate::home()?;
        let sources = list_sources_at(&home).context("failed to list template sources")?;
        let rows: Vec<SourceStatus> = sources.iter().map(SourceStatus::from).collect();

        if self.json {
            print_json(rows)?;
        } else {
            print_table(rows);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SourceStatus {
    namespace: String,
    name: String,
    phase: Phase,
    suspended: bool,
    ready: Option<ConditionStatus>,
    reason: String,
    message: String,
    head_version: Option<String>,
    templates: usize,
    last_fetch: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&ArenaTemplateSource> for SourceStatus {
    fn from(source: &ArenaTemplateSource) -> Self {
        let status = &source.status;
        let ready = find_condition(&status.conditions, CONDITION_READY);
        Self {
            namespace: source.metadata.namespace.0.clone(),
            name: source.metadata.name.0.clone(),
            phase: status.phase(),
            suspended: source.spec.suspend,
            ready: ready.map(|c| c.status),
            reason: ready.map(|c| c.reason.clone()).unwrap_or_default(),
            message: ready.map(|c| c.message.clone()).unwrap_or_default(),
            head_version: status.head_version.clone(),
            templates: status.templates.len(),
            last_fetch: status.last_fetch_time,
        }
    }
}

#[derive(Serialize)]
struct StatusReportJson {
    summary: StatusSummaryJson,
    sources: Vec<SourceStatusJson>,
}

#[derive(Serialize)]
struct StatusSummaryJson {
    sources: usize,
    ready: usize,
    errors: usize,
}

#[derive(Serialize)]
struct SourceStatusJson {
    source: String,
    phase: String,
    ready: bool,
    suspended: bool,
    reason: String,
    message: String,
    head_version: Option<String>,
    templates: usize,
    last_fetch_time: Option<String>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "reason")]
    reason: String,
    #[tabled(rename = "version")]
    version: String,
    #[tabled(rename = "templates")]
    templates: usize,
    #[tabled(rename = "last fetch")]
    last_fetch: String,
}

fn is_ready(row: &SourceStatus) -> bool {
    row.ready == Some(ConditionStatus::True)
}

fn print_json(rows: Vec<SourceStatus>) -> Result<()> {
    let payload = StatusReportJson {
        summary: StatusSummaryJson {
            sources: rows.len(),
            ready: rows.iter().filter(|r| is_ready(r)).count(),
            errors: rows.iter().filter(|r| r.phase == Phase::Error).count(),
        },
        sources: rows
            .into_iter()
            .map(|row| SourceStatusJson {
                source: format!("{}/{}", row.namespace, row.name),
                phase: row.phase.to_string(),
                ready: is_ready(&row),
                suspended: row.suspended,
                reason: row.reason,
                message: row.message,
                head_version: row.head_version,
                templates: row.templates,
                last_fetch_time: row.last_fetch.map(|t| t.to_rfc3339()),
            })
            .collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(rows: Vec<SourceStatus>) {
    let ready = rows.iter().filter(|r| is_ready(r)).count();
    let errors = rows.iter().filter(|r| r.phase == Phase::Error).count();
    println!(
        "Arena v{} | {} sources | {} ready | {} errors",
        env!("CARGO_PKG_VERSION"),
        rows.len(),
        ready,
        errors,
    );

    if rows.is_empty() {
        println!("No template sources found.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    println!("{separator}");
    println!(
        "Indicators: {} READY  {} FETCHING  {} PENDING  {} ERROR  {} SUSPENDED",
        "■".green().bold(),
        "■".cyan().bold(),
        "■".bright_black().bold(),
        "■".red().bold(),
        "■".yellow().bold(),
    );
    println!("{separator}");

    let mut grouped = BTreeMap::<String, Vec<SourceStatus>>::new();
    for row in rows {
        grouped.entry(row.namespace.clone()).or_default().push(row);
    }
    for (namespace, rows) in grouped {
        println!("{}", namespace.to_uppercase().bold());
        let table_rows: Vec<StatusTableRow> = rows
            .into_iter()
            .map(|row| StatusTableRow {
                phase: format!("{} {}", indicator(&row), row.phase),
                source: row.name,
                reason: row.reason,
                version: row.head_version.unwrap_or_else(|| "-".to_string()),
                templates: row.templates,
                last_fetch: row
                    .last_fetch
                    .map(format_age)
                    .unwrap_or_else(|| "never".to_string()),
            })
            .collect();
        let mut table = Table::new(table_rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("{separator}");
    }

    if errors > 0 {
        println!("Run 'arena reconcile <namespace>/<name>' to retry a failed source.");
    }
}

fn indicator(row: &SourceStatus) -> String {
    if row.suspended {
        return "■".yellow().bold().to_string();
    }
    match row.phase {
        Phase::Ready => "■".green().bold().to_string(),
        Phase::Fetching => "■".cyan().bold().to_string(),
        Phase::Pending => "■".bright_black().bold().to_string(),
        Phase::Error => "■".red().bold().to_string(),
    }
}

fn format_age(at: chrono::DateTime<chrono::Utc>) -> String {
    let secs = (chrono::Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
