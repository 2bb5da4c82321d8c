//! Backend adapter
//!
//! A backend turns "monitor this directory" requests into OS subscriptions
//! and pushes what it observes into a [`RawEventSink`]. The registry only
//! ever talks to the [`Backend`] trait; which implementation runs is decided
//! once, from [`WatcherConfig::backend`].

pub mod manual;
pub mod notify_backend;

pub use manual::ManualBackend;
pub use notify_backend::NotifyBackend;

use crate::config::{BackendKind, WatcherConfig};
use dirwatch_core::{BackendHandle, RawEvent, Result};
use std::path::{Path, PathBuf};

/// Channel end backends push raw events into
pub type RawEventSink = crossbeam_channel::Sender<RawEvent>;

/// Uniform interface over OS notification engines
pub trait Backend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// True when one recursive subscription covers a whole tree
    ///
    /// Directory-scoped backends (inotify, polling) need one subscription per
    /// directory, which the tree tracker maintains.
    fn tree_scoped(&self) -> bool {
        false
    }

    /// Start monitoring `path`
    ///
    /// Fails with `PathUnavailable` if the directory vanished and
    /// `BackendCapacity` if the OS is out of watch resources.
    fn start_monitoring(&self, path: &Path, recursive: bool) -> Result<BackendHandle>;

    /// Stop a subscription; unknown handles are ignored
    fn stop_monitoring(&self, handle: BackendHandle);
}

/// Build the backend selected by the configuration
pub fn platform_backend(config: &WatcherConfig, sink: RawEventSink) -> Result<Box<dyn Backend>> {
    let backend = match config.backend {
        BackendKind::Native => NotifyBackend::native(sink)?,
        BackendKind::Poll => NotifyBackend::poll(sink, config.poll_interval())?,
    };
    Ok(Box::new(backend))
}

/// Subscriptions that observe `entry`, with the entry's path relative to each
///
/// A subscription observes an entry when it is registered on the entry's
/// parent directory, or on any ancestor with `recursive` set.
pub(crate) fn observers<'a, I>(entry: &Path, subscriptions: I) -> Vec<(BackendHandle, PathBuf)>
where
    I: IntoIterator<Item = (BackendHandle, &'a Path, bool)>,
{
    let parent = match entry.parent() {
        Some(parent) => parent,
        None => return Vec::new(),
    };

    subscriptions
        .into_iter()
        .filter_map(|(handle, dir, recursive)| {
            let direct = dir == parent;
            let nested = recursive && entry != dir && entry.starts_with(dir);
            if !(direct || nested) {
                return None;
            }
            entry
                .strip_prefix(dir)
                .ok()
                .map(|relative| (handle, relative.to_path_buf()))
        })
        .collect()
}
