//! Backend over the `notify` crate
//!
//! One `notify` watcher serves every subscription. Overlapping subscriptions
//! on the same directory share a single OS registration (reference counted)
//! and each incoming event is fanned back out to every handle that observes
//! it, so watches never share subscriptions from the registry's point of view.

use super::{observers, Backend, RawEventSink};
use ahash::AHashMap;
use dirwatch_core::{BackendHandle, RawEvent, RawKind, Result, WatchError};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Identities synthesized for two-path renames live above any real cookie
const SYNTHETIC_IDENTITY_BIT: u64 = 1 << 63;

/// How long a change to a registered directory waits for its echo
const ECHO_WINDOW: Duration = Duration::from_secs(1);

/// Backend driven by a `notify` watcher
pub struct NotifyBackend {
    name: &'static str,
    tree_scoped: bool,
    /// Serializes OS registration changes
    watcher: Mutex<Box<dyn Watcher + Send>>,
    table: Arc<RwLock<SubscriptionTable>>,
    next_handle: AtomicU64,
}

#[derive(Default)]
struct SubscriptionTable {
    by_handle: AHashMap<BackendHandle, Registration>,
    /// OS registrations: path -> (handles, registered recursively)
    by_path: AHashMap<PathBuf, (SmallVec<[BackendHandle; 2]>, bool)>,
}

struct Registration {
    path: PathBuf,
    recursive: bool,
}

impl SubscriptionTable {
    fn os_mode(&self, path: &Path) -> Option<bool> {
        self.by_path.get(path).map(|(_, recursive)| *recursive)
    }

    fn insert(&mut self, handle: BackendHandle, path: &Path, recursive: bool, os_recursive: bool) {
        let slot = self
            .by_path
            .entry(path.to_path_buf())
            .or_insert_with(|| (SmallVec::new(), os_recursive));
        slot.0.push(handle);
        slot.1 = os_recursive;
        self.by_handle.insert(
            handle,
            Registration {
                path: path.to_path_buf(),
                recursive,
            },
        );
    }

    /// Remove a handle; returns the path if it was the last one on it
    fn remove(&mut self, handle: BackendHandle) -> Option<(PathBuf, bool)> {
        let registration = self.by_handle.remove(&handle)?;
        let last = match self.by_path.get_mut(&registration.path) {
            Some((handles, _)) => {
                handles.retain(|h| *h != handle);
                handles.is_empty()
            }
            None => false,
        };
        if last {
            self.by_path.remove(&registration.path);
        }
        Some((registration.path, last))
    }

    fn observers(&self, entry: &Path) -> Vec<(BackendHandle, PathBuf)> {
        let mut candidates = Vec::new();
        for ancestor in entry.ancestors().skip(1) {
            if let Some((handles, _)) = self.by_path.get(ancestor) {
                for handle in handles {
                    if let Some(registration) = self.by_handle.get(handle) {
                        candidates.push((
                            *handle,
                            registration.path.as_path(),
                            registration.recursive,
                        ));
                    }
                }
            }
        }
        observers(entry, candidates)
    }

    fn all_handles(&self) -> Vec<BackendHandle> {
        self.by_handle.keys().copied().collect()
    }
}

impl NotifyBackend {
    /// Backend over the platform's recommended notification API
    pub fn native(sink: RawEventSink) -> Result<Self> {
        let tree_scoped = cfg!(any(target_os = "macos", target_os = "windows"));
        let table = Arc::new(RwLock::new(SubscriptionTable::default()));
        let handler = event_handler(table.clone(), sink, Translator::new(!tree_scoped));
        let watcher = notify::recommended_watcher(handler)
            .map_err(|e| WatchError::Backend(format!("failed to create native watcher: {}", e)))?;

        Ok(Self {
            name: "native",
            tree_scoped,
            watcher: Mutex::new(Box::new(watcher)),
            table,
            next_handle: AtomicU64::new(1),
        })
    }

    /// Polling backend scanning every `interval`
    pub fn poll(sink: RawEventSink, interval: Duration) -> Result<Self> {
        let table = Arc::new(RwLock::new(SubscriptionTable::default()));
        // Every polled root is also an entry of its parent's scan
        let handler = event_handler(table.clone(), sink, Translator::new(true));
        let config = notify::Config::default().with_poll_interval(interval);
        let watcher = PollWatcher::new(handler, config)
            .map_err(|e| WatchError::Backend(format!("failed to create poll watcher: {}", e)))?;

        Ok(Self {
            name: "poll",
            tree_scoped: false,
            watcher: Mutex::new(Box::new(watcher)),
            table,
            next_handle: AtomicU64::new(1),
        })
    }
}

impl Backend for NotifyBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn tree_scoped(&self) -> bool {
        self.tree_scoped
    }

    fn start_monitoring(&self, path: &Path, recursive: bool) -> Result<BackendHandle> {
        let mut watcher = self.watcher.lock();

        // The table lock is never held across watch()/unwatch(): the notify
        // thread takes it while translating events and watch() may wait on
        // that thread.
        let current = self.table.read().os_mode(path);
        let wanted = current.unwrap_or(false) || recursive;

        if current != Some(wanted) {
            if current.is_some() {
                // Upgrading an existing registration to recursive
                let _ = watcher.unwatch(path);
            }
            if let Err(err) = watcher.watch(path, recursive_mode(wanted)) {
                if let Some(previous) = current {
                    let _ = watcher.watch(path, recursive_mode(previous));
                }
                return Err(map_notify_error(err, path));
            }
        }

        let handle = BackendHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.table.write().insert(handle, path, recursive, wanted);
        trace!("{} backend: {} monitoring {}", self.name, handle, path.display());
        Ok(handle)
    }

    fn stop_monitoring(&self, handle: BackendHandle) {
        let mut watcher = self.watcher.lock();
        let removed = self.table.write().remove(handle);

        if let Some((path, true)) = removed {
            // Fails harmlessly when the directory is already gone
            if let Err(e) = watcher.unwatch(&path) {
                debug!("{} backend: unwatch {} failed: {}", self.name, path.display(), e);
            }
        }
    }
}

fn recursive_mode(recursive: bool) -> RecursiveMode {
    if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    }
}

fn map_notify_error(err: notify::Error, path: &Path) -> WatchError {
    match err.kind {
        notify::ErrorKind::MaxFilesWatch => WatchError::BackendCapacity {
            path: path.to_path_buf(),
        },
        notify::ErrorKind::PathNotFound => WatchError::PathUnavailable {
            path: path.to_path_buf(),
        },
        notify::ErrorKind::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
            WatchError::PathUnavailable {
                path: path.to_path_buf(),
            }
        }
        _ => WatchError::Backend(format!("{}: {}", path.display(), err)),
    }
}

fn event_handler(
    table: Arc<RwLock<SubscriptionTable>>,
    sink: RawEventSink,
    mut translator: Translator,
) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |result: notify::Result<Event>| match result {
        Ok(event) => {
            let table = table.read();
            for raw in translator.translate(&table, &event, Instant::now()) {
                if sink.send(raw).is_err() {
                    // Router is gone; the watcher is shutting down
                    return;
                }
            }
        }
        Err(err) => warn!("notify reported an error: {}", err),
    }
}

/// Classified entry before it is fanned out to subscriptions
struct Observed<'a> {
    path: &'a Path,
    kind: RawKind,
    identity: Option<u64>,
    is_dir: Option<bool>,
}

impl<'a> Observed<'a> {
    fn new(path: &'a Path, kind: RawKind, identity: Option<u64>, is_dir: Option<bool>) -> Self {
        Self {
            path,
            kind,
            identity,
            is_dir,
        }
    }
}

/// Changes already reported for registered directories
///
/// Backends that register every directory on its own (inotify, polling)
/// report a change to a subscribed directory twice: once as an entry of its
/// parent's registration and once from the directory's own registration.
/// Only the first of the two is kept.
#[derive(Default)]
struct EchoFilter {
    seen: AHashMap<(PathBuf, RawKind), Instant>,
}

impl EchoFilter {
    /// False when `kind` on `path` repeats a change reported moments ago
    fn admit(
        &mut self,
        table: &SubscriptionTable,
        path: &Path,
        kind: RawKind,
        now: Instant,
    ) -> bool {
        match kind {
            // A directory reappearing starts a new lifetime
            RawKind::Added | RawKind::RenamedTo => {
                self.seen.retain(|(seen, _), _| seen != path);
                return true;
            }
            RawKind::Overflow => return true,
            RawKind::Removed | RawKind::RenamedFrom | RawKind::Modified => {}
        }

        let key = (path.to_path_buf(), kind);
        if let Some(at) = self.seen.remove(&key) {
            if now.saturating_duration_since(at) <= ECHO_WINDOW {
                return false;
            }
        }
        if table.by_path.contains_key(path) {
            self.seen.retain(|_, at| now.saturating_duration_since(*at) <= ECHO_WINDOW);
            self.seen.insert(key, now);
        }
        true
    }
}

/// Turns notify events into raw events for every observing handle
struct Translator {
    synthetic: u64,
    echoes: Option<EchoFilter>,
}

impl Translator {
    fn new(filter_echoes: bool) -> Self {
        Self {
            synthetic: 0,
            echoes: filter_echoes.then(EchoFilter::default),
        }
    }

    fn translate(
        &mut self,
        table: &SubscriptionTable,
        event: &Event,
        now: Instant,
    ) -> Vec<RawEvent> {
        if event.need_rescan() {
            return overflow(table, event);
        }

        let tracker = event.tracker().map(|t| t as u64);
        let mut observed: SmallVec<[Observed<'_>; 2]> = SmallVec::new();

        match event.kind {
            EventKind::Create(kind) => {
                let is_dir = match kind {
                    CreateKind::Folder => Some(true),
                    CreateKind::File => Some(false),
                    _ => None,
                };
                for path in &event.paths {
                    observed.push(Observed::new(path, RawKind::Added, None, is_dir));
                }
            }
            EventKind::Remove(kind) => {
                let is_dir = match kind {
                    RemoveKind::Folder => Some(true),
                    RemoveKind::File => Some(false),
                    _ => None,
                };
                for path in &event.paths {
                    observed.push(Observed::new(path, RawKind::Removed, None, is_dir));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    for path in &event.paths {
                        observed.push(Observed::new(path, RawKind::RenamedFrom, tracker, None));
                    }
                }
                RenameMode::To => {
                    for path in &event.paths {
                        observed.push(Observed::new(path, RawKind::RenamedTo, tracker, None));
                    }
                }
                RenameMode::Both => {
                    // inotify already sent the From/To halves carrying this cookie
                    if tracker.is_none() && event.paths.len() >= 2 {
                        let identity = SYNTHETIC_IDENTITY_BIT | self.synthetic;
                        self.synthetic = self.synthetic.wrapping_add(1);
                        observed.push(Observed::new(
                            &event.paths[0],
                            RawKind::RenamedFrom,
                            Some(identity),
                            None,
                        ));
                        observed.push(Observed::new(
                            &event.paths[1],
                            RawKind::RenamedTo,
                            Some(identity),
                            None,
                        ));
                    }
                }
                // FSEvents cannot tell the halves apart; existence decides
                RenameMode::Any | RenameMode::Other => {
                    for path in &event.paths {
                        let kind = if path.symlink_metadata().is_ok() {
                            RawKind::RenamedTo
                        } else {
                            RawKind::RenamedFrom
                        };
                        observed.push(Observed::new(path, kind, tracker, None));
                    }
                }
            },
            EventKind::Modify(_) | EventKind::Any => {
                for path in &event.paths {
                    observed.push(Observed::new(path, RawKind::Modified, None, None));
                }
            }
            EventKind::Access(_) | EventKind::Other => {
                trace!("ignoring notify event: {:?}", event.kind);
            }
        }

        let mut raw_events = Vec::with_capacity(observed.len());
        for entry in observed {
            if let Some(echoes) = self.echoes.as_mut() {
                if !echoes.admit(table, entry.path, entry.kind, now) {
                    trace!("dropping repeated {:?} for {}", entry.kind, entry.path.display());
                    continue;
                }
            }
            // Only directories are ever registered
            let is_dir = if table.by_path.contains_key(entry.path) {
                Some(true)
            } else {
                entry.is_dir
            };
            for (handle, relative) in table.observers(entry.path) {
                let mut raw = RawEvent::new(handle, relative, entry.kind);
                raw.identity = entry.identity;
                raw.is_dir = is_dir;
                raw_events.push(raw);
            }
        }
        raw_events
    }
}

fn overflow(table: &SubscriptionTable, event: &Event) -> Vec<RawEvent> {
    let handles = if event.paths.is_empty() {
        table.all_handles()
    } else {
        let mut handles = Vec::new();
        for path in &event.paths {
            if let Some((on_path, _)) = table.by_path.get(path) {
                handles.extend(on_path.iter().copied());
            }
            handles.extend(table.observers(path).into_iter().map(|(h, _)| h));
        }
        handles.sort();
        handles.dedup();
        handles
    };

    handles
        .into_iter()
        .map(|handle| RawEvent::new(handle, PathBuf::new(), RawKind::Overflow))
        .collect()
}
