//! Prefix administration commands.

use anyhow::Result;
use console::style;

use serialforge::config::EngineConfig;
use serialforge::engine::{Engine, PrefixSettings};
use serialforge::store::PrefixStatus;

use super::super::PrefixCommands;
use super::print_json;
use super::status::print_row;

pub async fn cmd_prefix(config: &EngineConfig, command: PrefixCommands, json: bool) -> Result<()> {
    let engine = Engine::from_config(config)?;

    match command {
        PrefixCommands::Add {
            prefix,
            digits,
            no_space,
            start,
        } => {
            let settings = PrefixSettings {
                digits: digits.unwrap_or(config.allocator.default_digits),
                has_space: !no_space,
                starting_number: start,
            };
            let record = engine.configure_prefix(&prefix, settings).await?;
            if json {
                return print_json(&record);
            }
            println!(
                "{} {} ({} digits, next serial {}, status {})",
                style("Configured").green().bold(),
                record.prefix,
                record.digits,
                record.last_number + 1,
                record.status
            );
        }
        PrefixCommands::Show { prefix } => match engine.prefix(&prefix).await? {
            Some(record) if json => print_json(&record)?,
            Some(record) => {
                println!();
                print_row(&record);
                println!();
                println!("  digits:     {}", record.digits);
                println!("  ceiling:    {}", record.max_serial());
                println!("  updated_at: {}", record.updated_at);
                println!();
            }
            None => anyhow::bail!("Prefix {} not found", prefix.trim().to_uppercase()),
        },
        PrefixCommands::SetStatus { prefix, status } => {
            let status: PrefixStatus = status.parse().map_err(anyhow::Error::msg)?;
            let record = engine.set_prefix_status(&prefix, status).await?;
            if json {
                return print_json(&record);
            }
            println!("{} is now {}", record.prefix, style(record.status).bold());
        }
        PrefixCommands::ResetCompleted => {
            let reset = engine.reset_completed().await?;
            if json {
                return print_json(&reset);
            }
            if reset.is_empty() {
                println!("No completed prefixes to reset.");
            } else {
                println!("Reset {} prefixes to pending: {}", reset.len(), reset.join(", "));
            }
        }
        PrefixCommands::Log { prefix, limit } => {
            let entries = engine.recent_log(&prefix, limit).await?;
            if json {
                return print_json(&entries);
            }
            if entries.is_empty() {
                println!("No serial log entries for {}.", prefix.trim().to_uppercase());
                return Ok(());
            }
            println!();
            println!("{:<20} {:<10} {:<12} Created", "Identifier", "Outcome", "Value");
            println!("{:<20} {:<10} {:<12} -------", "----------", "-------", "-----");
            for entry in &entries {
                println!(
                    "{:<20} {:<10} {:<12} {}",
                    entry.identifier,
                    entry.outcome.as_str(),
                    entry.value.as_deref().unwrap_or("-"),
                    entry.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
        }
    }
    Ok(())
}
