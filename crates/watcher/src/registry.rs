//! Watch registry
//!
//! Owns every active watch. Two concurrent indexes answer the router's
//! questions: which watch owns a backend handle, and where that watch lives.
//! Everything mutable about a watch sits behind its own mutex, so unrelated
//! watches never contend.
//!
//! Lock order: a `DashMap` guard is never held while a watch mutex is taken.
//! Callers clone the `Arc<WatchEntry>` out first.

use crate::backend::Backend;
use crate::config::WatcherConfig;
use crate::correlate::RenameCorrelator;
use crate::dispatch::{self, Callback, DispatchQueue, DispatchWorker};
use crate::tree::{self, SubscriptionSet, TreeContext, Visit};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use dashmap::DashMap;
use dirwatch_core::path::canonicalize_dir;
use dirwatch_core::{BackendHandle, Result, WatchError, WatchId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Snapshot of an active watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchInfo {
    pub id: WatchId,
    /// Canonical root directory
    pub root: PathBuf,
    pub recursive: bool,
    /// Directories currently subscribed for this watch, in path order
    pub directories: Vec<PathBuf>,
}

/// Publishes asynchronous failures on the watcher's error channel
pub(crate) struct ErrorSink {
    tx: Sender<(WatchId, WatchError)>,
}

impl ErrorSink {
    pub(crate) fn new(capacity: usize) -> (Self, Receiver<(WatchId, WatchError)>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    pub(crate) fn report(&self, watch_id: WatchId, err: WatchError) {
        error!("watch {}: {}", watch_id, err);
        if let Err(TrySendError::Full((_, err))) = self.tx.try_send((watch_id, err)) {
            warn!("error channel full, dropping: {}", err);
        }
    }
}

/// Mutable part of a watch
pub(crate) struct WatchState {
    /// Set by `remove_watch`; the router ignores removed watches
    pub(crate) removed: bool,
    pub(crate) subscriptions: SubscriptionSet,
    pub(crate) correlator: RenameCorrelator,
    /// `None` once the watch is removed
    pub(crate) queue: Option<DispatchQueue>,
}

pub(crate) struct WatchEntry {
    pub(crate) id: WatchId,
    pub(crate) root: PathBuf,
    pub(crate) recursive: bool,
    /// Recursive on a directory-scoped backend: one subscription per directory
    pub(crate) tracked: bool,
    pub(crate) state: Mutex<WatchState>,
    worker: Mutex<Option<DispatchWorker>>,
}

pub(crate) struct Registry {
    backend: Arc<dyn Backend>,
    config: WatcherConfig,
    watches: DashMap<WatchId, Arc<WatchEntry>>,
    handles: DashMap<BackendHandle, WatchId>,
    next_id: AtomicU64,
    errors: ErrorSink,
}

impl Registry {
    pub(crate) fn new(backend: Arc<dyn Backend>, config: WatcherConfig, errors: ErrorSink) -> Self {
        Self {
            backend,
            config,
            watches: DashMap::new(),
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
            errors,
        }
    }

    pub(crate) fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub(crate) fn context(&self, watch_id: WatchId) -> TreeContext<'_> {
        TreeContext {
            backend: self.backend.as_ref(),
            handles: &self.handles,
            errors: &self.errors,
            watch_id,
        }
    }

    /// Register a watch and subscribe its tree
    ///
    /// Returns once the root and (for recursive watches) every descendant
    /// directory found by the initial walk are subscribed.
    pub(crate) fn add_watch(
        &self,
        path: &Path,
        recursive: bool,
        callback: Callback,
    ) -> Result<WatchId> {
        let root = canonicalize_dir(path)?;
        let id = WatchId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (queue, worker) = dispatch::spawn(id, callback)?;

        let tree_scoped = self.backend.tree_scoped();
        let entry = Arc::new(WatchEntry {
            id,
            root,
            recursive,
            tracked: recursive && !tree_scoped,
            state: Mutex::new(WatchState {
                removed: false,
                subscriptions: SubscriptionSet::default(),
                correlator: RenameCorrelator::new(
                    id,
                    self.config.rename_window(),
                    self.config.max_pending_renames,
                ),
                queue: Some(queue),
            }),
            worker: Mutex::new(Some(worker)),
        });
        self.watches.insert(id, entry.clone());

        let ctx = self.context(id);
        let mut state = entry.state.lock();
        let subscribed = if state.removed {
            Err(WatchError::UnknownWatch(id))
        } else {
            ctx.subscribe(&mut state.subscriptions, &entry.root, recursive && tree_scoped)
        };
        drop(state);
        if let Err(e) = subscribed {
            self.discard(id);
            return Err(e);
        }

        if entry.tracked {
            if let Err(e) = self.discover(&ctx, &entry) {
                self.discard(id);
                return Err(e);
            }
        }

        info!(
            "watch {}: watching {} ({}, {} directories)",
            id,
            entry.root.display(),
            if recursive { "recursive" } else { "flat" },
            entry.state.lock().subscriptions.len()
        );
        Ok(id)
    }

    /// Initial walk of a tracked watch
    ///
    /// The watch lock is taken per directory so the router keeps delivering
    /// while large trees are walked.
    fn discover(&self, ctx: &TreeContext<'_>, entry: &WatchEntry) -> Result<()> {
        tree::walk_directories(&entry.root, false, |dir| {
            let mut state = entry.state.lock();
            if state.removed {
                return Ok(Visit::Stop);
            }
            match ctx.subscribe(&mut state.subscriptions, dir, false) {
                Ok(_) => Ok(Visit::Descend),
                Err(e) if e.is_recoverable() => {
                    warn!("watch {}: skipping {}: {}", entry.id, dir.display(), e);
                    Ok(Visit::Prune)
                }
                Err(e) => Err(e),
            }
        })
    }

    fn discard(&self, id: WatchId) {
        if let Err(e) = self.remove_watch(id) {
            debug!("watch {}: already gone during rollback: {}", id, e);
        }
    }

    /// Tear a watch down
    ///
    /// Every subscription is cancelled and pending rename halves are flushed
    /// before the dispatch queue closes. Blocks until the events already queued
    /// have been delivered, unless called from the watch's own callback, in
    /// which case the queued events are discarded instead.
    pub(crate) fn remove_watch(&self, id: WatchId) -> Result<()> {
        let (_, entry) = self
            .watches
            .remove(&id)
            .ok_or(WatchError::UnknownWatch(id))?;

        let dropped = {
            let mut state = entry.state.lock();
            let state = &mut *state;
            state.removed = true;
            let dropped = self.context(id).unsubscribe_all(&mut state.subscriptions);

            let mut flushed = Vec::new();
            state.correlator.flush_all(&mut flushed);
            if let Some(queue) = state.queue.take() {
                queue.send_all(flushed);
            }
            dropped
        };

        let worker = entry.worker.lock().take();
        if let Some(worker) = worker {
            if worker.is_current() {
                debug!("watch {}: removed from its own callback", id);
                worker.cancel();
            } else {
                worker.join();
            }
        }

        info!(
            "watch {}: removed {} ({} subscriptions)",
            id,
            entry.root.display(),
            dropped
        );
        Ok(())
    }

    pub(crate) fn info(&self, id: WatchId) -> Result<WatchInfo> {
        let entry = self.entry(id).ok_or(WatchError::UnknownWatch(id))?;
        let state = entry.state.lock();
        Ok(WatchInfo {
            id,
            root: entry.root.clone(),
            recursive: entry.recursive,
            directories: state
                .subscriptions
                .directories()
                .map(Path::to_path_buf)
                .collect(),
        })
    }

    /// Ids of all active watches, ascending
    pub(crate) fn ids(&self) -> Vec<WatchId> {
        let mut ids: Vec<_> = self.watches.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub(crate) fn entry(&self, id: WatchId) -> Option<Arc<WatchEntry>> {
        self.watches.get(&id).map(|e| e.value().clone())
    }

    pub(crate) fn entries(&self) -> Vec<Arc<WatchEntry>> {
        self.watches.iter().map(|e| e.value().clone()).collect()
    }

    /// Watch that owns a backend handle
    pub(crate) fn owner_of(&self, handle: BackendHandle) -> Option<Arc<WatchEntry>> {
        let id = *self.handles.get(&handle)?;
        self.entry(id)
    }
}
