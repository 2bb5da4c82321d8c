//! Periodic reconciliation
//!
//! Incremental tracking can miss directories: the backend may overflow, or a
//! directory may be created and populated before its parent's event arrives.
//! Reconciliation walks the tree of a recursive watch and diffs it against the
//! subscription arena, subscribing what is missing and forgetting what is gone.

use crate::tree::{self, SubscriptionSet, TreeContext, Visit};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

/// Decides when the next periodic pass is due
#[derive(Debug)]
pub(crate) struct Reconciler {
    /// Pass interval; `None` disables periodic passes
    interval: Option<Duration>,

    last_run: Instant,
}

impl Reconciler {
    pub(crate) fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last_run: Instant::now(),
        }
    }

    /// True (and the timer restarted) if a pass should run at `now`
    pub(crate) fn due(&mut self, now: Instant) -> bool {
        match self.interval {
            Some(interval) if now.saturating_duration_since(self.last_run) >= interval => {
                self.last_run = now;
                true
            }
            _ => false,
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReconcileReport {
    pub(crate) subscribed: usize,
    pub(crate) dropped: usize,
}

impl ReconcileReport {
    pub(crate) fn changed(&self) -> bool {
        self.subscribed > 0 || self.dropped > 0
    }
}

/// Every real directory under `root`, `root` included
///
/// Runs without any watch lock held; the result may be stale by the time it
/// is applied.
pub(crate) fn scan_directories(root: &Path) -> BTreeSet<PathBuf> {
    let mut found = BTreeSet::new();
    let walked = tree::walk_directories(root, true, |dir| {
        found.insert(dir.to_path_buf());
        Ok(Visit::Descend)
    });
    if let Err(e) = walked {
        warn!("reconciliation walk of {} failed: {}", root.display(), e);
    }
    found
}

/// Bring `set` in line with a fresh scan of `root`
///
/// Directories absent from the scan are only dropped if they are really gone
/// from disk by now, so a directory created after the scan survives.
pub(crate) fn apply(
    ctx: &TreeContext<'_>,
    set: &mut SubscriptionSet,
    root: &Path,
    scanned: &BTreeSet<PathBuf>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let stale: Vec<PathBuf> = set
        .directories()
        .filter(|dir| *dir != root && !scanned.contains(*dir))
        .filter(|dir| !dir.is_dir())
        .map(Path::to_path_buf)
        .collect();
    for dir in &stale {
        // A parent earlier in the list may already have taken it
        if set.contains(dir) {
            report.dropped += ctx.unsubscribe_subtree(set, dir);
        }
    }

    // Ordered set: parents come before their children
    for dir in scanned {
        if set.contains(dir) {
            continue;
        }
        match ctx.subscribe(set, dir, false) {
            Ok(_) => report.subscribed += 1,
            Err(e) if e.is_recoverable() => {
                warn!("watch {}: skipping {}: {}", ctx.watch_id, dir.display(), e);
            }
            Err(e) => {
                ctx.errors.report(ctx.watch_id, e);
                break;
            }
        }
    }

    report
}
