//! dirwatch CLI - watch directories and print their events

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod cmd;
mod settings;

/// dirwatch - Filesystem change notifications
#[derive(Parser)]
#[command(name = "dirwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch directories and print every event until Ctrl-C
    Watch {
        /// Directories to watch
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Only report direct children of each path
        #[arg(long)]
        no_recursive: bool,

        #[command(flatten)]
        overrides: settings::Overrides,

        /// Events buffered per watch before new ones are dropped
        #[arg(long, default_value = "10")]
        buffer: usize,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config {
        #[command(flatten)]
        overrides: settings::Overrides,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Watch {
            paths,
            no_recursive,
            overrides,
            buffer,
            json,
        } => cmd::watch::run(&paths, !no_recursive, &overrides, buffer, json).await,
        Commands::Config { overrides } => cmd::config::run(&overrides),
    }
}

/// Install the fmt subscriber, optionally writing to a file
fn init_tracing(log_file: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}
