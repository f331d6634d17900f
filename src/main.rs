use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use serialforge::config::EngineConfig;
use serialforge::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "serialforge")]
#[command(version, about = "Sequential identifier engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resume pending work and run the engine until Ctrl-C
    Run {
        /// Seconds between serials (overrides engine.generation_interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Migrate legacy statuses and report outstanding work without starting
    Reconcile,
    /// Show store counts and every prefix
    Status,
    /// Show the store summary only
    Summary,
    /// Create, inspect and change prefixes
    Prefix {
        #[command(subcommand)]
        command: PrefixCommands,
    },
    /// Allocate one serial outside the scheduler
    Generate {
        prefix: String,
        /// Digit width for a new prefix
        #[arg(short, long)]
        digits: Option<u32>,
        /// Join prefix and serial without a space
        #[arg(long)]
        no_space: bool,
        /// Allocate only; skip lookup, recording and audit
        #[arg(long)]
        dry_run: bool,
    },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PrefixCommands {
    /// Create or reconfigure a prefix
    Add {
        prefix: String,
        /// Digit width (defaults to allocator.default_digits)
        #[arg(short, long)]
        digits: Option<u32>,
        /// Join prefix and serial without a space
        #[arg(long)]
        no_space: bool,
        /// Last serial already used; generation resumes at start + 1
        #[arg(long, default_value = "0")]
        start: u64,
    },
    /// Show one prefix
    Show { prefix: String },
    /// Change a prefix's status (not_started, pending, completed)
    SetStatus { prefix: String, status: String },
    /// Move every completed prefix back to pending with a fresh counter
    ResetCompleted,
    /// Show the newest serial log entries for a prefix
    Log {
        prefix: String,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Write a default engine.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    dotenvy::from_path(project_dir.join(".env")).ok();

    // Config commands must work even when the file on disk is invalid.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let config = EngineConfig::load(&project_dir).context("Failed to load configuration")?;
    init_logging(&config.logging, cli.verbose);

    match &cli.command {
        Commands::Run { interval } => cmd::cmd_run(&config, *interval).await?,
        Commands::Reconcile => cmd::cmd_reconcile(&config, cli.json).await?,
        Commands::Status => cmd::cmd_status(&config, cli.json).await?,
        Commands::Summary => cmd::cmd_summary(&config, cli.json).await?,
        Commands::Prefix { command } => cmd::cmd_prefix(&config, command.clone(), cli.json).await?,
        Commands::Generate {
            prefix,
            digits,
            no_space,
            dry_run,
        } => {
            let has_space = no_space.then_some(false);
            cmd::cmd_generate(&config, prefix, *digits, has_space, *dry_run, cli.json).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
