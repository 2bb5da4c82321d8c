//! Directory tree tracking for recursive watches
//!
//! Directory-scoped backends only report events for the immediate children of
//! a subscribed directory, so a recursive watch needs one subscription per
//! directory in its tree. The tracker keeps that set in sync with the disk:
//! created or moved-in directories are subscribed (with their whole subtree),
//! removed or moved-out ones are forgotten together with everything below.
//!
//! Subscriptions live in a [`SubscriptionSet`] arena keyed by path. Since
//! `Path` ordering is component-wise, a directory and all of its descendants
//! form one contiguous range of the ordered map.

use crate::backend::Backend;
use crate::registry::ErrorSink;
use ahash::AHashMap;
use dashmap::DashMap;
use dirwatch_core::path::file_name_string;
use dirwatch_core::{Action, BackendHandle, NotifiedEvent, RawKind, Result, WatchId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Monitored directories of one watch
#[derive(Debug, Default)]
pub(crate) struct SubscriptionSet {
    by_path: BTreeMap<PathBuf, BackendHandle>,
    by_handle: AHashMap<BackendHandle, PathBuf>,
}

impl SubscriptionSet {
    pub(crate) fn insert(&mut self, path: PathBuf, handle: BackendHandle) {
        self.by_handle.insert(handle, path.clone());
        self.by_path.insert(path, handle);
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    pub(crate) fn path_of(&self, handle: BackendHandle) -> Option<&Path> {
        self.by_handle.get(&handle).map(PathBuf::as_path)
    }

    pub(crate) fn directories(&self) -> impl Iterator<Item = &Path> + '_ {
        self.by_path.keys().map(PathBuf::as_path)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_path.len()
    }

    /// Remove `dir` and every subscription below it
    pub(crate) fn remove_subtree(&mut self, dir: &Path) -> Vec<(PathBuf, BackendHandle)> {
        let doomed: Vec<PathBuf> = self
            .by_path
            .range(dir.to_path_buf()..)
            .take_while(|(path, _)| path.starts_with(dir))
            .map(|(path, _)| path.clone())
            .collect();

        doomed
            .into_iter()
            .filter_map(|path| {
                let handle = self.by_path.remove(&path)?;
                self.by_handle.remove(&handle);
                Some((path, handle))
            })
            .collect()
    }

    /// Remove every subscription
    pub(crate) fn drain(&mut self) -> Vec<(PathBuf, BackendHandle)> {
        self.by_handle.clear();
        std::mem::take(&mut self.by_path).into_iter().collect()
    }
}

/// Everything a watch needs to change its subscriptions
pub(crate) struct TreeContext<'a> {
    pub(crate) backend: &'a dyn Backend,
    pub(crate) handles: &'a DashMap<BackendHandle, WatchId>,
    pub(crate) errors: &'a ErrorSink,
    pub(crate) watch_id: WatchId,
}

impl TreeContext<'_> {
    /// Subscribe `dir` unless it already is
    ///
    /// Returns the new handle, or `None` when `dir` was already monitored.
    pub(crate) fn subscribe(
        &self,
        set: &mut SubscriptionSet,
        dir: &Path,
        recursive: bool,
    ) -> Result<Option<BackendHandle>> {
        if set.contains(dir) {
            return Ok(None);
        }

        let handle = self.backend.start_monitoring(dir, recursive)?;
        self.handles.insert(handle, self.watch_id);
        set.insert(dir.to_path_buf(), handle);
        trace!("watch {}: subscribed {} as {}", self.watch_id, dir.display(), handle);
        Ok(Some(handle))
    }

    /// Stop monitoring `dir` and its descendants; returns how many were dropped
    pub(crate) fn unsubscribe_subtree(&self, set: &mut SubscriptionSet, dir: &Path) -> usize {
        let removed = set.remove_subtree(dir);
        self.release(&removed);
        removed.len()
    }

    pub(crate) fn unsubscribe_all(&self, set: &mut SubscriptionSet) -> usize {
        let removed = set.drain();
        self.release(&removed);
        removed.len()
    }

    fn release(&self, removed: &[(PathBuf, BackendHandle)]) {
        for (path, handle) in removed {
            self.handles.remove(handle);
            self.backend.stop_monitoring(*handle);
            trace!("watch {}: unsubscribed {}", self.watch_id, path.display());
        }
    }
}

/// What a directory walk should do after visiting a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visit {
    Descend,
    Prune,
    Stop,
}

/// Depth-first walk over the directories under `root`
///
/// Symlinks are never followed, so a symlinked directory is a leaf. Entries
/// that vanish or cannot be read mid-walk are skipped.
pub(crate) fn walk_directories<F>(root: &Path, include_root: bool, mut visit: F) -> Result<()>
where
    F: FnMut(&Path) -> Result<Visit>,
{
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(if include_root { 0 } else { 1 })
        .sort_by_file_name()
        .into_iter();

    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }

        match visit(entry.path())? {
            Visit::Descend => {}
            Visit::Prune => walker.skip_current_dir(),
            Visit::Stop => break,
        }
    }
    Ok(())
}

/// Apply one raw event to a recursive watch's subscriptions
///
/// Synthetic `Added` events for entries found in newly created directories
/// are appended to `out` when `announce` is set.
#[allow(clippy::too_many_arguments)]
pub(crate) fn observe(
    ctx: &TreeContext<'_>,
    set: &mut SubscriptionSet,
    directory: &Path,
    filename: &str,
    kind: RawKind,
    is_dir: Option<bool>,
    announce: bool,
    out: &mut Vec<NotifiedEvent>,
) {
    let path = directory.join(filename);
    match kind {
        RawKind::Added | RawKind::RenamedTo => {
            if is_dir == Some(false) || !is_real_directory(&path) {
                return;
            }
            let announce = announce && kind == RawKind::Added;
            let added = expand(ctx, set, &path, announce, out);
            if added > 0 {
                debug!(
                    "watch {}: tracking {} new directories under {}",
                    ctx.watch_id,
                    added,
                    path.display()
                );
            }
        }
        RawKind::Removed | RawKind::RenamedFrom => {
            if !set.contains(&path) {
                return;
            }
            let dropped = ctx.unsubscribe_subtree(set, &path);
            debug!(
                "watch {}: stopped tracking {} directories under {}",
                ctx.watch_id,
                dropped,
                path.display()
            );
        }
        RawKind::Modified | RawKind::Overflow => {}
    }
}

/// Subscribe `dir` and its whole subtree; returns the number of new subscriptions
pub(crate) fn expand(
    ctx: &TreeContext<'_>,
    set: &mut SubscriptionSet,
    dir: &Path,
    announce: bool,
    out: &mut Vec<NotifiedEvent>,
) -> usize {
    let mut added = 0;
    let walked = walk_directories(dir, true, |path| match ctx.subscribe(set, path, false) {
        Ok(Some(_)) => {
            added += 1;
            if announce {
                announce_entries(ctx.watch_id, path, out);
            }
            Ok(Visit::Descend)
        }
        Ok(None) => Ok(Visit::Descend),
        Err(e) if e.is_recoverable() => {
            warn!("watch {}: skipping {}: {}", ctx.watch_id, path.display(), e);
            Ok(Visit::Prune)
        }
        Err(e) => {
            ctx.errors.report(ctx.watch_id, e);
            Ok(Visit::Stop)
        }
    });
    if let Err(e) = walked {
        ctx.errors.report(ctx.watch_id, e);
    }
    added
}

/// Report every entry currently inside `dir` as `Added`
fn announce_entries(watch_id: WatchId, dir: &Path, out: &mut Vec<NotifiedEvent>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("watch {}: cannot list {}: {}", watch_id, dir.display(), e);
            return;
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| file_name_string(&entry.file_name()))
        .collect();
    names.sort();

    out.extend(
        names
            .into_iter()
            .map(|name| NotifiedEvent::new(watch_id, dir, name, Action::Added)),
    );
}

fn is_real_directory(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|metadata| metadata.is_dir())
        .unwrap_or(false)
}
