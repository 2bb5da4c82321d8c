//! Shared helpers for watcher integration tests

use dirwatch::{ManualBackend, NotifiedEvent, Watcher, WatcherConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Events recorded by a test callback
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<NotifiedEvent>>>,
}

#[allow(dead_code)]
impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback that appends to this recorder
    pub fn callback(&self) -> impl FnMut(NotifiedEvent) + Send + 'static {
        let events = self.events.clone();
        move |event| events.lock().push(event)
    }

    pub fn events(&self) -> Vec<NotifiedEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Wait until `predicate` holds for the recorded events
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[NotifiedEvent]) -> bool,
    {
        wait_until(timeout, || predicate(&self.events.lock()))
    }

    /// Wait until at least `count` events were recorded
    pub fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        self.wait_for(timeout, |events| events.len() >= count)
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Watcher over an in-memory backend the test drives by hand
#[allow(dead_code)]
pub fn manual_watcher(rename_window: Duration) -> (Watcher, ManualBackend) {
    let mut manual = None;
    let watcher = Watcher::with_backend(WatcherConfig::new(rename_window), |sink| {
        let backend = ManualBackend::new(sink);
        manual = Some(backend.clone());
        Ok(backend)
    })
    .unwrap();
    (watcher, manual.unwrap())
}
