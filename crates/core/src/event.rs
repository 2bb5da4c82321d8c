//! Watch identifiers and event types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// Identifier of an active watch
///
/// Assigned monotonically by the registry and never reused within a process.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchId(u64);

impl WatchId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle for one backend subscription (one monitored directory)
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct BackendHandle(u64);

impl BackendHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a raw backend notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawKind {
    /// Entry created
    Added,
    /// Entry deleted
    Removed,
    /// Entry content or metadata changed
    Modified,
    /// First half of a rename (the old name)
    RenamedFrom,
    /// Second half of a rename (the new name)
    RenamedTo,
    /// Backend dropped events; the subscription tree must be rescanned
    Overflow,
}

/// Unnormalized notification produced by a backend
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Subscription the event was observed on
    pub handle: BackendHandle,
    /// Entry path relative to the subscribed directory
    ///
    /// A plain file name for directory-scoped backends; tree-scoped
    /// backends may report nested relative paths.
    pub filename: PathBuf,
    /// What happened
    pub kind: RawKind,
    /// Rename cookie or inode, when the backend knows one
    pub identity: Option<u64>,
    /// Whether the entry is a directory, when the backend knows
    pub is_dir: Option<bool>,
    /// When the backend observed the event
    pub timestamp: Instant,
}

impl RawEvent {
    /// Create a raw event stamped with the current time
    pub fn new(handle: BackendHandle, filename: impl Into<PathBuf>, kind: RawKind) -> Self {
        Self {
            handle,
            filename: filename.into(),
            kind,
            identity: None,
            is_dir: None,
            timestamp: Instant::now(),
        }
    }

    pub fn with_identity(mut self, identity: u64) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_is_dir(mut self, is_dir: bool) -> Self {
        self.is_dir = Some(is_dir);
        self
    }
}

/// Public action taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Added,
    Removed,
    Modified,
    Moved,
}

impl Action {
    /// Canonical name ("Added", "Removed", "Modified", "Moved")
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Added => "Added",
            Action::Removed => "Removed",
            Action::Modified => "Modified",
            Action::Moved => "Moved",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized event delivered to a watch callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedEvent {
    /// Watch the event belongs to
    pub watch_id: WatchId,
    /// Absolute directory containing the entry
    pub directory: PathBuf,
    /// Entry name inside `directory`
    pub filename: String,
    /// What happened
    pub action: Action,
    /// Previous name; present iff `action == Action::Moved`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_filename: Option<String>,
}

impl NotifiedEvent {
    /// Create a non-move event
    pub fn new(
        watch_id: WatchId,
        directory: impl Into<PathBuf>,
        filename: impl Into<String>,
        action: Action,
    ) -> Self {
        debug_assert!(action != Action::Moved, "moves carry an old filename");
        Self {
            watch_id,
            directory: directory.into(),
            filename: filename.into(),
            action,
            old_filename: None,
        }
    }

    /// Create a move event
    pub fn moved(
        watch_id: WatchId,
        directory: impl Into<PathBuf>,
        old_filename: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            watch_id,
            directory: directory.into(),
            filename: filename.into(),
            action: Action::Moved,
            old_filename: Some(old_filename.into()),
        }
    }

    /// Full path of the entry
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }
}
