//! Configuration command
//!
//! Prints the configuration `dirwatch watch` would run with.

use crate::settings::{self, Overrides};
use anyhow::{Context, Result};

pub fn run(overrides: &Overrides) -> Result<()> {
    let config = settings::resolve(overrides)?;

    match settings::config_source(overrides)? {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# No config file found, using defaults"),
    }
    let text = config
        .to_toml_string()
        .context("Failed to serialize configuration")?;
    print!("{}", text);
    Ok(())
}
