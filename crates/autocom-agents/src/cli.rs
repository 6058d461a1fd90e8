//! Command-line surface.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use orchestration::config::OrchestrationConfig;
use orchestration::health::HealthStatus;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

use crate::app::App;

/// Prefix marking a REPL line as a multi-step command.
pub const MULTI_STEP_PREFIX: char = '+';

#[derive(Parser, Debug)]
#[command(author, version, about = "Desktop automation assistant", long_about = None)]
pub struct Args {
    /// TOML config file (AUTOCOM_* environment variables override it)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter; takes precedence over RUST_LOG when given
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Conversation id that groups interaction history
    #[arg(long = "context", global = true, default_value = "cli")]
    pub context_id: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Classify one command and route it to an agent
    Process {
        #[arg(required = true, num_args = 1..)]
        input: Vec<String>,
    },
    /// Split a compound command into steps and run them in order
    Multi {
        #[arg(required = true, num_args = 1..)]
        input: Vec<String>,
    },
    /// Run every health check once and print the report
    Health,
    /// Read commands from stdin; prefix a line with '+' for multi-step
    Repl,
}

/// One parsed REPL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplLine<'a> {
    Skip,
    Quit,
    Health,
    Single(&'a str),
    Multi(&'a str),
}

/// Log filter for the process: `--log-level` if given, else `RUST_LOG`,
/// else `info`.
pub fn log_filter(log_level: Option<&str>) -> Result<EnvFilter, ParseError> {
    match log_level {
        Some(level) => EnvFilter::try_new(level),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}

pub fn parse_repl_line(line: &str) -> ReplLine<'_> {
    let line = line.trim();
    match line {
        "" => ReplLine::Skip,
        "quit" | "exit" => ReplLine::Quit,
        "health" => ReplLine::Health,
        _ => match line.strip_prefix(MULTI_STEP_PREFIX) {
            Some(rest) if rest.trim().is_empty() => ReplLine::Skip,
            Some(rest) => ReplLine::Multi(rest.trim()),
            None => ReplLine::Single(line),
        },
    }
}

pub async fn run(args: Args) -> Result<()> {
    let config = OrchestrationConfig::load(args.config.as_deref())?;
    let mut app = App::build(config)?;
    app.start();

    match &args.command {
        Command::Process { input } => app.process(&input.join(" "), &args.context_id).await,
        Command::Multi { input } => {
            let cmd = app.run_multi_step(&input.join(" "), &args.context_id).await;
            println!("{}", serde_json::to_string_pretty(&cmd)?);
        }
        Command::Health => {
            let health = app.check_health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            let status = health.status;
            app.shutdown().await;
            if status == HealthStatus::Unhealthy {
                anyhow::bail!("System is unhealthy");
            }
            return Ok(());
        }
        Command::Repl => {
            app.start_health_monitor();
            repl(&app, &args.context_id).await?;
        }
    }

    app.shutdown().await;
    Ok(())
}

async fn repl(app: &App, context_id: &str) -> Result<()> {
    info!(context_id, "Interactive session started");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_repl_line(&line) {
            ReplLine::Skip => continue,
            ReplLine::Quit => break,
            ReplLine::Health => {
                let health = app.check_health().await;
                println!("{}", serde_json::to_string_pretty(&health)?);
            }
            ReplLine::Single(input) => app.process(input, context_id).await,
            ReplLine::Multi(input) => {
                let cmd = app.run_multi_step(input, context_id).await;
                println!("{} ({} steps): {}", cmd.id, cmd.sub_tasks.len(), cmd.status);
            }
        }
    }
    Ok(())
}
