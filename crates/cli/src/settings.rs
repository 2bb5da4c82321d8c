//! Effective watcher configuration for the CLI
//!
//! Sources, later ones winning: built-in CLI defaults, the config file
//! (`--config`, or `<config dir>/dirwatch/config.toml` when present), then
//! command-line flags.

use anyhow::{Context, Result};
use clap::Args;
use dirwatch::WatcherConfig;
use std::path::{Path, PathBuf};
use toml::{Table, Value};

/// Rename window used when neither the file nor the flags set one
pub const DEFAULT_RENAME_WINDOW_MS: u64 = 100;

/// Flags that override the configuration file
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Configuration file (default: <config dir>/dirwatch/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// How long a rename half waits for its partner
    #[arg(long, value_name = "MS")]
    pub rename_window_ms: Option<u64>,

    /// Use the polling backend instead of native notifications
    #[arg(long)]
    pub poll: bool,

    /// Scan interval of the polling backend
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Rescan recursive watch trees this often
    #[arg(long, value_name = "MS")]
    pub reconcile_interval_ms: Option<u64>,
}

/// Default configuration file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dirwatch").join("config.toml"))
}

/// Config file to read, if any
///
/// An explicit `--config` must exist; the default location is optional.
pub fn config_source(overrides: &Overrides) -> Result<Option<PathBuf>> {
    if let Some(path) = &overrides.config {
        if !path.is_file() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        return Ok(Some(path.clone()));
    }
    Ok(default_config_path().filter(|path| path.is_file()))
}

/// Build the effective configuration
pub fn resolve(overrides: &Overrides) -> Result<WatcherConfig> {
    let table = match config_source(overrides)? {
        Some(path) => read_table(&path)?,
        None => Table::new(),
    };
    build(table, overrides)
}

fn read_table(path: &Path) -> Result<Table> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    text.parse::<Table>()
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

fn build(mut table: Table, overrides: &Overrides) -> Result<WatcherConfig> {
    set_ms(&mut table, "rename_window_ms", overrides.rename_window_ms);
    set_ms(&mut table, "poll_interval_ms", overrides.poll_interval_ms);
    set_ms(&mut table, "reconcile_interval_ms", overrides.reconcile_interval_ms);
    if overrides.poll {
        table.insert("backend".to_string(), Value::String("poll".to_string()));
    }
    if !table.contains_key("rename_window_ms") {
        table.insert(
            "rename_window_ms".to_string(),
            Value::Integer(DEFAULT_RENAME_WINDOW_MS as i64),
        );
    }

    let config: WatcherConfig = Value::Table(table)
        .try_into()
        .context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn set_ms(table: &mut Table, key: &str, value: Option<u64>) {
    if let Some(ms) = value {
        table.insert(key.to_string(), Value::Integer(ms as i64));
    }
}
