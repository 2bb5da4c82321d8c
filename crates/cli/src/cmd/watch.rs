//! Watch command
//!
//! Streams the events of every requested path to stdout until Ctrl-C, then
//! removes the watches and waits for each stream to drain.

use crate::settings::{self, Overrides};
use anyhow::{Context, Result};
use dirwatch::{Action, NotifiedEvent, Watcher};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::info;

pub async fn run(
    paths: &[PathBuf],
    recursive: bool,
    overrides: &Overrides,
    buffer: usize,
    json: bool,
) -> Result<()> {
    let config = settings::resolve(overrides)?;
    let watcher = Watcher::new(config).context("Failed to start watcher")?;
    info!("using {} backend", watcher.backend_name());

    let mut streams = Vec::with_capacity(paths.len());
    for path in paths {
        let (id, events) = watcher
            .add_watch_channel(path, recursive, buffer)
            .with_context(|| format!("Failed to watch {}", path.display()))?;
        eprintln!(
            "{} {} {}",
            "Watching".green(),
            path.display(),
            format!("(watch {})", id).dimmed()
        );
        streams.push(tokio::spawn(print_events(path.clone(), events, json)));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    eprintln!("{}", "Received interrupt, shutting down watchers...".yellow());

    for id in watcher.watches() {
        watcher
            .remove_watch(id)
            .with_context(|| format!("Failed to remove watch {}", id))?;
    }
    for stream in streams {
        stream.await.context("Event printer failed")?;
    }

    eprintln!("{}", "Done".green());
    Ok(())
}

async fn print_events(path: PathBuf, mut events: mpsc::Receiver<NotifiedEvent>, json: bool) {
    while let Some(event) = events.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to encode event: {}", e),
            }
        } else {
            println!("{}", format_event(&event));
        }
    }
    eprintln!("{} {} is finished", "Watcher for".dimmed(), path.display());
}

/// Human-readable line for one event
pub fn format_event(event: &NotifiedEvent) -> String {
    let action = match event.action {
        Action::Added => "added".green().to_string(),
        Action::Removed => "removed".red().to_string(),
        Action::Modified => "modified".yellow().to_string(),
        Action::Moved => "moved".cyan().to_string(),
    };
    let directory = display_dir(&event.directory);

    match &event.old_filename {
        Some(old) => format!(
            "{} {} (formerly {}) in {}",
            action,
            event.filename.bold(),
            old,
            directory
        ),
        None => format!("{} {} in {}", action, event.filename.bold(), directory),
    }
}

fn display_dir(dir: &Path) -> String {
    dir.display().to_string().dimmed().to_string()
}
