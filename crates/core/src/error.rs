//! Error taxonomy for watch operations

use crate::event::WatchId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the registry, the tracker and backends
#[derive(Debug, Error)]
pub enum WatchError {
    /// Watch target is missing or is not a directory
    #[error("invalid watch path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// Watch id was never issued or has already been removed
    #[error("unknown watch {0}")]
    UnknownWatch(WatchId),

    /// Backend could not subscribe to a path (usually deleted mid-operation)
    #[error("path unavailable: {}", path.display())]
    PathUnavailable { path: PathBuf },

    /// Backend ran out of OS watch resources
    #[error("backend capacity exhausted while monitoring {}", path.display())]
    BackendCapacity { path: PathBuf },

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl WatchError {
    /// Build an `InvalidPath` error
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors a recursive walk recovers from by skipping the directory
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PathUnavailable { .. })
    }
}
