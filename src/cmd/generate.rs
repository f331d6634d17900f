//! One-shot serial generation.

use anyhow::Result;
use console::style;

use serialforge::audit::LogOutcome;
use serialforge::config::EngineConfig;
use serialforge::engine::Engine;

use super::print_json;

pub async fn cmd_generate(
    config: &EngineConfig,
    prefix: &str,
    digits: Option<u32>,
    has_space: Option<bool>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let engine = Engine::from_config(config)?;
    let report = engine.generate_once(prefix, digits, has_space, dry_run).await?;
    if json {
        return print_json(&report);
    }

    println!("{}", style(&report.identifier).bold());
    if dry_run {
        println!("  (dry run: lookup and recording skipped)");
    } else {
        let value = match (&report.value, report.outcome) {
            (_, LogOutcome::Error) => style("lookup failed".to_string()).red(),
            (Some(value), _) => style(value.clone()).green(),
            (None, _) => style("not found".to_string()).dim(),
        };
        println!("  value:    {}", value);
        if let Some(location) = &report.location {
            println!("  recorded: {}", location);
        }
    }
    if report.exhausted {
        println!(
            "  {} {} has reached its last serial",
            style("note:").yellow(),
            report.prefix
        );
    }
    Ok(())
}
