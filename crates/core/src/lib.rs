//! Core types for dirwatch
//!
//! This crate provides:
//! - Watch and backend identifiers
//! - Raw (backend) and notified (public) event types
//! - The error taxonomy shared by every layer
//! - Path canonicalization and comparison helpers

pub mod error;
pub mod event;
pub mod path;

// Re-exports
pub use error::WatchError;
pub use event::{Action, BackendHandle, NotifiedEvent, RawEvent, RawKind, WatchId};
pub use path::PathKey;

/// Result type for watch operations
pub type Result<T> = std::result::Result<T, WatchError>;
