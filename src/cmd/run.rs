//! Long-running engine and one-shot reconciliation.

use anyhow::{Context, Result};
use console::style;
use tracing::warn;

use serialforge::config::EngineConfig;
use serialforge::engine::{Engine, ResumeSummary};
use serialforge::lookup::HttpLookupClient;
use serialforge::recorder::ResultRecorder;

use super::print_json;

pub async fn cmd_run(config: &EngineConfig, interval: Option<u64>) -> Result<()> {
    let mut config = config.clone();
    if let Some(secs) = interval {
        if secs == 0 {
            anyhow::bail!("--interval must be greater than zero");
        }
        config.engine.generation_interval_secs = secs;
    }

    preflight(&config).await?;
    let engine = Engine::from_config(&config)?;
    if let Some(summary) = boot(&engine).await {
        print_resume(&summary);
    }
    println!(
        "Engine {} (serial every {}s, monitor every {}s). Press Ctrl-C to stop.",
        if engine.is_running() {
            style("running").green().bold()
        } else {
            style("idle").yellow().bold()
        },
        config.engine.generation_interval_secs,
        config.engine.monitor_interval_secs,
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!();
    println!("Stopping...");
    engine.shutdown().await;

    let stats = engine.get_stats();
    println!(
        "Generated {} serials, {} found, {} errors ({:.1}% success).",
        stats.total_generated, stats.total_found, stats.errors, stats.success_rate
    );
    Ok(())
}

/// Boot the engine. A failed startup reconciliation is reported and the
/// engine keeps running; the change monitor reconciles again on its next poll.
async fn boot(engine: &Engine) -> Option<ResumeSummary> {
    match engine.boot().await {
        Ok(summary) => Some(summary),
        Err(e) => {
            warn!(error = %e, "Continuing after failed startup reconciliation");
            println!(
                "{} startup reconciliation failed: {}. The change monitor will retry.",
                style("warning:").yellow().bold(),
                e
            );
            None
        }
    }
}

/// Check the lookup service and result log. Failures are reported but do
/// not block startup; items retry on their own.
async fn preflight(config: &EngineConfig) -> Result<()> {
    if config.lookup.enabled {
        let lookup = HttpLookupClient::new(&config.lookup)?;
        if !lookup.health_check().await {
            println!(
                "{} lookup service at {} is not answering",
                style("warning:").yellow().bold(),
                config.lookup.base_url
            );
        }
    } else {
        println!("{} lookup disabled, no values will be found", style("note:").dim());
    }

    let log = ResultRecorder::log_from_config(&config.recorder)?;
    if !log.health_check().await {
        println!(
            "{} {:?} result log is not reachable",
            style("warning:").yellow().bold(),
            config.recorder.backend
        );
    }
    Ok(())
}

pub async fn cmd_reconcile(config: &EngineConfig, json: bool) -> Result<()> {
    let engine = Engine::from_config(config)?;
    let summary = engine.reconcile().await?;
    if json {
        return print_json(&summary);
    }
    print_resume(&summary);
    Ok(())
}

fn print_resume(summary: &ResumeSummary) {
    println!();
    println!("{}", style("Resume summary").bold());
    println!("  Pending:     {}", list(&summary.pending_to_process));
    println!("  Not started: {}", list(&summary.not_started_to_process));
    println!("  Completed:   {}", list(&summary.completed));
    println!("  To automate: {}", summary.total_to_automate);
    println!();
}

fn list(prefixes: &[String]) -> String {
    if prefixes.is_empty() {
        style("-").dim().to_string()
    } else {
        prefixes.join(", ")
    }
}
