//! Filesystem watch registry with event dispatch
//!
//! This crate provides:
//! - A registry of watches, each with its own callback
//! - Recursive tracking of directory trees on directory-scoped backends
//! - Normalization of raw backend events into Added/Removed/Modified/Moved
//! - Rename correlation within a configurable window
//! - Per-watch serialized delivery, concurrent across watches
//!
//! ```no_run
//! use dirwatch::{Watcher, WatcherConfig};
//! use std::time::Duration;
//!
//! let watcher = Watcher::new(WatcherConfig::new(Duration::from_millis(100)))?;
//! let id = watcher.add_watch("/tmp", true, |event| println!("{:?}", event))?;
//! // ...
//! watcher.remove_watch(id)?;
//! # Ok::<(), dirwatch::WatchError>(())
//! ```

pub mod backend;
pub mod config;
pub mod correlate;
mod dispatch;
mod reconcile;
mod registry;
mod router;
mod tree;

pub use backend::{Backend, ManualBackend, NotifyBackend, RawEventSink};
pub use config::{BackendKind, WatcherConfig};
pub use dirwatch_core::{
    Action, BackendHandle, NotifiedEvent, RawEvent, RawKind, Result, WatchError, WatchId,
};
pub use registry::WatchInfo;

use crossbeam_channel::{Receiver, Sender};
use registry::{ErrorSink, Registry};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Capacity of the asynchronous error channel
const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Handle to a running watcher
///
/// Dropping it stops the router and removes every remaining watch.
pub struct Watcher {
    registry: Arc<Registry>,
    errors: Receiver<(WatchId, WatchError)>,
    shutdown: Option<Sender<()>>,
    router: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Start a watcher on the backend selected by `config.backend`
    pub fn new(config: WatcherConfig) -> Result<Self> {
        config.validate()?;
        let (sink, raw) = crossbeam_channel::unbounded();
        let backend = backend::platform_backend(&config, sink)?;
        Self::start(Arc::from(backend), config, raw)
    }

    /// Start a watcher on a caller-provided backend
    ///
    /// `build` receives the sink the backend must push raw events into.
    pub fn with_backend<B, F>(config: WatcherConfig, build: F) -> Result<Self>
    where
        B: Backend + 'static,
        F: FnOnce(RawEventSink) -> Result<B>,
    {
        config.validate()?;
        let (sink, raw) = crossbeam_channel::unbounded();
        let backend: Arc<dyn Backend> = Arc::new(build(sink)?);
        Self::start(backend, config, raw)
    }

    fn start(
        backend: Arc<dyn Backend>,
        config: WatcherConfig,
        raw: Receiver<RawEvent>,
    ) -> Result<Self> {
        let (errors, error_rx) = ErrorSink::new(ERROR_CHANNEL_CAPACITY);
        let registry = Arc::new(Registry::new(backend, config, errors));
        let (shutdown, shutdown_rx) = crossbeam_channel::bounded(1);
        let router = router::spawn(registry.clone(), raw, shutdown_rx)?;

        Ok(Self {
            registry,
            errors: error_rx,
            shutdown: Some(shutdown),
            router: Some(router),
        })
    }

    /// Watch `path`, invoking `callback` for every event
    ///
    /// The callback runs on the watch's own delivery thread, never
    /// concurrently with itself. A panicking callback is logged and
    /// delivery continues.
    pub fn add_watch<P, F>(&self, path: P, recursive: bool, callback: F) -> Result<WatchId>
    where
        P: AsRef<Path>,
        F: FnMut(NotifiedEvent) + Send + 'static,
    {
        self.registry
            .add_watch(path.as_ref(), recursive, Box::new(callback))
    }

    /// Watch `path`, streaming events into a bounded channel
    ///
    /// Events that find the channel full are discarded with a warning. The
    /// receiver yields `None` once the watch is removed and drained.
    pub fn add_watch_channel<P>(
        &self,
        path: P,
        recursive: bool,
        buffer: usize,
    ) -> Result<(WatchId, mpsc::Receiver<NotifiedEvent>)>
    where
        P: AsRef<Path>,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.add_watch(path, recursive, move |event: NotifiedEvent| {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => warn!(
                    "watch {}: channel full, dropping {} for {}",
                    event.watch_id, event.action, event.filename
                ),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        })?;
        Ok((id, rx))
    }

    /// Stop a watch
    ///
    /// Returns once every event already queued for it has been delivered.
    /// Fails with `UnknownWatch` if the id is not active.
    pub fn remove_watch(&self, id: WatchId) -> Result<()> {
        self.registry.remove_watch(id)
    }

    /// Describe an active watch
    pub fn lookup(&self, id: WatchId) -> Result<WatchInfo> {
        self.registry.info(id)
    }

    /// Ids of all active watches, ascending
    pub fn watches(&self) -> Vec<WatchId> {
        self.registry.ids()
    }

    /// Failures that happen outside any call, such as capacity exhaustion
    /// while tracking a new directory
    pub fn errors(&self) -> Receiver<(WatchId, WatchError)> {
        self.errors.clone()
    }

    pub fn backend_name(&self) -> &'static str {
        self.registry.backend_name()
    }

    pub fn config(&self) -> &WatcherConfig {
        self.registry.config()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(router) = self.router.take() {
            if router.join().is_err() {
                error!("router thread panicked");
            }
        }
        for id in self.registry.ids() {
            // Already gone if removed concurrently
            let _ = self.registry.remove_watch(id);
        }
    }
}
