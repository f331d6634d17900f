//! Store reporting commands.

use anyhow::Result;
use console::style;
use serde::Serialize;

use serialforge::config::EngineConfig;
use serialforge::engine::{DatabaseSummary, Engine};
use serialforge::store::{PrefixRecord, PrefixStatus};

use super::print_json;

pub async fn cmd_summary(config: &EngineConfig, json: bool) -> Result<()> {
    let engine = Engine::from_config(config)?;
    let summary = engine.database_summary().await?;
    if json {
        #[derive(Serialize)]
        struct Counts<'a> {
            total_prefixes: usize,
            by_status: &'a std::collections::BTreeMap<String, usize>,
        }
        return print_json(&Counts {
            total_prefixes: summary.total_prefixes,
            by_status: &summary.by_status,
        });
    }
    print_counts(&summary);
    Ok(())
}

pub async fn cmd_status(config: &EngineConfig, json: bool) -> Result<()> {
    let engine = Engine::from_config(config)?;
    let summary = engine.database_summary().await?;
    if json {
        return print_json(&summary);
    }

    print_counts(&summary);
    if summary.prefixes.is_empty() {
        println!("No prefixes yet. Add one with 'serialforge prefix add <PREFIX>'.");
        println!();
        return Ok(());
    }

    println!(
        "{:<12} {:<12} {:>14} {:>14} {:<7} Remarks",
        "Prefix", "Status", "Last", "Remaining", "Space"
    );
    println!(
        "{:<12} {:<12} {:>14} {:>14} {:<7} -------",
        "------------", "------------", "--------------", "--------------", "-----"
    );
    for record in &summary.prefixes {
        print_row(record);
    }
    println!();
    Ok(())
}

fn print_counts(summary: &DatabaseSummary) {
    println!();
    println!("{} prefixes", style(summary.total_prefixes).bold());
    for (status, count) in &summary.by_status {
        println!("  {:<12} {}", status, count);
    }
    println!();
}

pub(crate) fn print_row(record: &PrefixRecord) {
    let status = match record.status {
        PrefixStatus::NotStarted => style(record.status.as_str()).dim(),
        PrefixStatus::Pending => style(record.status.as_str()).yellow(),
        PrefixStatus::Completed => style(record.status.as_str()).green(),
    };
    println!(
        "{:<12} {:<12} {:>14} {:>14} {:<7} {}",
        record.prefix,
        status,
        record.last_number,
        record.remaining(),
        if record.has_space { "yes" } else { "no" },
        record.remarks.as_deref().unwrap_or("")
    );
}
