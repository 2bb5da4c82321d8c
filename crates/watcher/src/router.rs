//! Router thread
//!
//! Moves raw events from the backend channel to the watch that owns their
//! handle, running the tree tracker and the rename correlator under that
//! watch's lock before handing the results to its dispatch queue. A periodic
//! tick expires unmatched rename halves and drives reconciliation.

use crate::reconcile::{self, Reconciler};
use crate::registry::{Registry, WatchEntry};
use crate::tree;
use crossbeam_channel::{select, Receiver};
use dirwatch_core::path::split_entry;
use dirwatch_core::{RawEvent, RawKind, Result, WatchError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

pub(crate) struct Router {
    registry: Arc<Registry>,
    reconciler: Reconciler,
}

/// Start the router; it exits when `shutdown` fires or disconnects
pub(crate) fn spawn(
    registry: Arc<Registry>,
    raw: Receiver<RawEvent>,
    shutdown: Receiver<()>,
) -> Result<JoinHandle<()>> {
    let reconciler = Reconciler::new(registry.config().reconcile_interval());
    let router = Router {
        registry,
        reconciler,
    };

    thread::Builder::new()
        .name("dirwatch-router".to_string())
        .spawn(move || router.run(raw, shutdown))
        .map_err(|e| WatchError::Backend(format!("failed to spawn router: {}", e)))
}

impl Router {
    fn run(mut self, raw: Receiver<RawEvent>, shutdown: Receiver<()>) {
        let ticker = crossbeam_channel::tick(self.registry.config().tick());
        debug!("router started ({} backend)", self.registry.backend_name());

        loop {
            select! {
                recv(raw) -> event => match event {
                    Ok(event) => self.route(event),
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    // Route what is already queued first so a rename half
                    // is never expired while its partner waits in the channel
                    for _ in 0..raw.len() {
                        match raw.try_recv() {
                            Ok(event) => self.route(event),
                            Err(_) => break,
                        }
                    }
                    self.tick(Instant::now());
                },
                recv(shutdown) -> _ => break,
            }
        }
        debug!("router stopped");
    }

    pub(crate) fn route(&mut self, raw: RawEvent) {
        let entry = match self.registry.owner_of(raw.handle) {
            Some(entry) => entry,
            None => {
                trace!("dropping event for unbound handle {}", raw.handle);
                return;
            }
        };

        if raw.kind == RawKind::Overflow {
            warn!(
                "watch {}: backend overflow, events may have been lost",
                entry.id
            );
            self.reconcile(&entry);
            return;
        }

        let mut out = Vec::new();
        let mut guard = entry.state.lock();
        let state = &mut *guard;
        if state.removed {
            return;
        }

        let split = state
            .subscriptions
            .path_of(raw.handle)
            .and_then(|dir| split_entry(dir, &raw.filename));
        let (directory, filename) = match split {
            Some(split) => split,
            None => {
                trace!("watch {}: ignoring {:?}", entry.id, raw.filename);
                return;
            }
        };
        trace!(
            "watch {}: {:?} {} in {}",
            entry.id,
            raw.kind,
            filename,
            directory.display()
        );

        // Entries of new directories go out after the event that created them
        let mut announced = Vec::new();
        if entry.tracked {
            let ctx = self.registry.context(entry.id);
            tree::observe(
                &ctx,
                &mut state.subscriptions,
                &directory,
                &filename,
                raw.kind,
                raw.is_dir,
                self.registry.config().announce_new_directory_entries,
                &mut announced,
            );
        }
        state.correlator.push(
            directory,
            filename,
            raw.kind,
            raw.identity,
            raw.timestamp,
            &mut out,
        );
        out.append(&mut announced);

        if let Some(queue) = &state.queue {
            queue.send_all(out);
        }
    }

    pub(crate) fn tick(&mut self, now: Instant) {
        let entries = self.registry.entries();

        for entry in &entries {
            let mut out = Vec::new();
            let mut guard = entry.state.lock();
            let state = &mut *guard;
            if state.removed {
                continue;
            }
            state.correlator.expire(now, &mut out);
            if let Some(queue) = &state.queue {
                queue.send_all(out);
            }
        }

        if self.reconciler.due(now) {
            for entry in entries.iter().filter(|entry| entry.tracked) {
                self.reconcile(entry);
            }
        }
    }

    fn reconcile(&self, entry: &WatchEntry) {
        if !entry.tracked {
            return;
        }

        let scanned = reconcile::scan_directories(&entry.root);
        let mut state = entry.state.lock();
        if state.removed {
            return;
        }
        let ctx = self.registry.context(entry.id);
        let report = reconcile::apply(&ctx, &mut state.subscriptions, &entry.root, &scanned);

        if report.changed() {
            info!(
                "watch {}: reconciled {} (+{} / -{} directories)",
                entry.id,
                entry.root.display(),
                report.subscribed,
                report.dropped
            );
        } else {
            debug!("watch {}: reconciliation found nothing", entry.id);
        }
    }
}
