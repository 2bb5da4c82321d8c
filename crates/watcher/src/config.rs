//! Watcher configuration
//!
//! Loaded from TOML or built in code. The rename correlation window has no
//! built-in default and must always be supplied.

use dirwatch_core::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which OS event source backs the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Platform notification API (inotify, FSEvents, ReadDirectoryChangesW, kqueue)
    #[default]
    Native,
    /// Periodic directory scans
    Poll,
}

/// Watcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// How long an unmatched rename half waits for its partner
    pub rename_window_ms: u64,

    /// Event source (default: native)
    #[serde(default)]
    pub backend: BackendKind,

    /// Scan interval for the polling backend (default: 1000ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum unmatched rename halves held per watch (default: 1024)
    #[serde(default = "default_max_pending_renames")]
    pub max_pending_renames: usize,

    /// Periodic rescan of recursive watch trees (default: disabled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_interval_ms: Option<u64>,

    /// Report entries found inside newly created directories (default: true)
    #[serde(default = "default_true")]
    pub announce_new_directory_entries: bool,

    /// Router housekeeping tick (default: half the rename window, at least 5ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_ms: Option<u64>,
}

impl WatcherConfig {
    /// Configuration with the given rename window and defaults elsewhere
    ///
    /// The window is stored in whole milliseconds, rounded up.
    pub fn new(rename_window: Duration) -> Self {
        Self {
            rename_window_ms: whole_millis(rename_window),
            backend: BackendKind::default(),
            poll_interval_ms: default_poll_interval_ms(),
            max_pending_renames: default_max_pending_renames(),
            reconcile_interval_ms: None,
            announce_new_directory_entries: true,
            tick_ms: None,
        }
    }

    /// Parse from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| WatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WatchError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML text
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| WatchError::Config(e.to_string()))
    }

    /// Reject values the watcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.rename_window_ms == 0 {
            return Err(WatchError::Config("rename_window_ms must be positive".into()));
        }
        if self.max_pending_renames == 0 {
            return Err(WatchError::Config("max_pending_renames must be positive".into()));
        }
        if self.backend == BackendKind::Poll && self.poll_interval_ms == 0 {
            return Err(WatchError::Config("poll_interval_ms must be positive".into()));
        }
        if self.reconcile_interval_ms == Some(0) {
            return Err(WatchError::Config("reconcile_interval_ms must be positive".into()));
        }
        if self.tick_ms == Some(0) {
            return Err(WatchError::Config("tick_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn rename_window(&self) -> Duration {
        Duration::from_millis(self.rename_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_ms.map(Duration::from_millis)
    }

    pub fn tick(&self) -> Duration {
        match self.tick_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis((self.rename_window_ms / 2).max(5)),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_pending_renames() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}
