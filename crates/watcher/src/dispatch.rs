//! Per-watch event delivery
//!
//! Every watch owns an ordering queue drained by its own delivery thread, so
//! a callback is never invoked concurrently with itself while unrelated
//! watches deliver in parallel.

use crossbeam_channel::{Receiver, Sender};
use dirwatch_core::{NotifiedEvent, Result, WatchError, WatchId};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Boxed watch callback
pub(crate) type Callback = Box<dyn FnMut(NotifiedEvent) + Send + 'static>;

/// Sending side of a watch's ordering queue
pub(crate) struct DispatchQueue {
    watch_id: WatchId,
    tx: Sender<NotifiedEvent>,
}

impl DispatchQueue {
    pub(crate) fn send(&self, event: NotifiedEvent) {
        if self.tx.send(event).is_err() {
            trace!("watch {}: dispatcher already finished", self.watch_id);
        }
    }

    pub(crate) fn send_all(&self, events: impl IntoIterator<Item = NotifiedEvent>) {
        for event in events {
            self.send(event);
        }
    }
}

/// Delivery thread of one watch
pub(crate) struct DispatchWorker {
    watch_id: WatchId,
    thread: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

impl DispatchWorker {
    /// True when called from inside this watch's callback
    pub(crate) fn is_current(&self) -> bool {
        self.thread.thread().id() == thread::current().id()
    }

    /// Discard whatever is still queued instead of delivering it
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Wait until every queued event has been delivered
    ///
    /// The queue must already be closed (its `DispatchQueue` dropped).
    pub(crate) fn join(self) {
        if self.thread.join().is_err() {
            error!("watch {}: dispatcher thread panicked", self.watch_id);
        }
    }
}

/// Start the delivery thread for a watch
pub(crate) fn spawn(
    watch_id: WatchId,
    callback: Callback,
) -> Result<(DispatchQueue, DispatchWorker)> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();

    let thread = thread::Builder::new()
        .name(format!("dirwatch-dispatch-{}", watch_id))
        .spawn(move || run(watch_id, rx, callback, flag))
        .map_err(|e| WatchError::Backend(format!("failed to spawn dispatcher: {}", e)))?;

    Ok((
        DispatchQueue { watch_id, tx },
        DispatchWorker {
            watch_id,
            thread,
            cancelled,
        },
    ))
}

fn run(
    watch_id: WatchId,
    rx: Receiver<NotifiedEvent>,
    mut callback: Callback,
    cancelled: Arc<AtomicBool>,
) {
    for event in rx.iter() {
        if cancelled.load(Ordering::Acquire) {
            break;
        }
        deliver(watch_id, &mut callback, event);
    }
    debug!("watch {}: dispatcher finished", watch_id);
}

/// Invoke the callback, containing any panic
///
/// Returns false if the callback panicked.
fn deliver(watch_id: WatchId, callback: &mut Callback, event: NotifiedEvent) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                "watch {}: callback panicked: {}",
                watch_id,
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
