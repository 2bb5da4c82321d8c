//! In-memory backend fed by the caller
//!
//! Nothing is read from the OS: the embedder (or a test) decides which raw
//! events happen via [`ManualBackend::emit`]. Subscriptions are tracked so
//! events reach exactly the handles that would observe them, and resource
//! exhaustion or vanished paths can be simulated.

use super::{observers, Backend, RawEventSink};
use ahash::AHashSet;
use dirwatch_core::{BackendHandle, RawEvent, RawKind, Result, WatchError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Backend whose events are injected by the caller
#[derive(Clone)]
pub struct ManualBackend {
    inner: Arc<Inner>,
}

struct Inner {
    sink: RawEventSink,
    tree_scoped: bool,
    next_handle: AtomicU64,
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    subscriptions: BTreeMap<BackendHandle, (PathBuf, bool)>,
    limit: Option<usize>,
    unavailable: AHashSet<PathBuf>,
}

impl ManualBackend {
    /// Directory-scoped manual backend
    pub fn new(sink: RawEventSink) -> Self {
        Self::build(sink, false)
    }

    /// Manual backend that covers whole trees with one subscription
    pub fn tree_scoped(sink: RawEventSink) -> Self {
        Self::build(sink, true)
    }

    fn build(sink: RawEventSink, tree_scoped: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                tree_scoped,
                next_handle: AtomicU64::new(1),
                state: Mutex::new(ManualState::default()),
            }),
        }
    }

    /// Fail new subscriptions with `BackendCapacity` beyond `limit` active ones
    pub fn set_limit(&self, limit: Option<usize>) {
        self.inner.state.lock().limit = limit;
    }

    /// Fail subscriptions to `path` with `PathUnavailable`
    pub fn make_unavailable(&self, path: impl Into<PathBuf>) {
        self.inner.state.lock().unavailable.insert(path.into());
    }

    /// Directories currently monitored, one entry per subscription
    pub fn active_paths(&self) -> Vec<PathBuf> {
        let state = self.inner.state.lock();
        let mut paths: Vec<_> = state.subscriptions.values().map(|(p, _)| p.clone()).collect();
        paths.sort();
        paths
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Report `kind` for `dir/name` to every subscription observing it
    ///
    /// Returns how many subscriptions received the event.
    pub fn emit(&self, dir: &Path, name: impl AsRef<Path>, kind: RawKind) -> usize {
        self.emit_with(dir, name, kind, None, None)
    }

    /// Report a rename as two halves sharing `identity`
    pub fn emit_rename(&self, dir: &Path, from: &str, to: &str, identity: Option<u64>) -> usize {
        self.emit_with(dir, from, RawKind::RenamedFrom, identity, None)
            + self.emit_with(dir, to, RawKind::RenamedTo, identity, None)
    }

    /// Report an event with explicit identity and directory hint
    pub fn emit_with(
        &self,
        dir: &Path,
        name: impl AsRef<Path>,
        kind: RawKind,
        identity: Option<u64>,
        is_dir: Option<bool>,
    ) -> usize {
        let entry = dir.join(name);
        let targets = {
            let state = self.inner.state.lock();
            observers(
                &entry,
                state
                    .subscriptions
                    .iter()
                    .map(|(handle, (path, recursive))| (*handle, path.as_path(), *recursive)),
            )
        };

        for (handle, relative) in &targets {
            let mut raw = RawEvent::new(*handle, relative.clone(), kind);
            raw.identity = identity;
            raw.is_dir = is_dir;
            let _ = self.inner.sink.send(raw);
        }
        targets.len()
    }

    /// Report that events were lost under `dir`
    pub fn emit_overflow(&self, dir: &Path) -> usize {
        let handles: Vec<_> = {
            let state = self.inner.state.lock();
            state
                .subscriptions
                .iter()
                .filter(|(_, (path, _))| path == dir)
                .map(|(handle, _)| *handle)
                .collect()
        };
        for handle in &handles {
            let _ = self
                .inner
                .sink
                .send(RawEvent::new(*handle, PathBuf::new(), RawKind::Overflow));
        }
        handles.len()
    }

    /// Push a prepared raw event unchanged
    pub fn send(&self, event: RawEvent) {
        let _ = self.inner.sink.send(event);
    }
}

impl Backend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn tree_scoped(&self) -> bool {
        self.inner.tree_scoped
    }

    fn start_monitoring(&self, path: &Path, recursive: bool) -> Result<BackendHandle> {
        let mut state = self.inner.state.lock();

        if state.unavailable.contains(path) || !path.exists() {
            return Err(WatchError::PathUnavailable {
                path: path.to_path_buf(),
            });
        }
        if let Some(limit) = state.limit {
            if state.subscriptions.len() >= limit {
                return Err(WatchError::BackendCapacity {
                    path: path.to_path_buf(),
                });
            }
        }

        let handle = BackendHandle::new(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        state
            .subscriptions
            .insert(handle, (path.to_path_buf(), recursive));
        Ok(handle)
    }

    fn stop_monitoring(&self, handle: BackendHandle) {
        self.inner.state.lock().subscriptions.remove(&handle);
    }
}
