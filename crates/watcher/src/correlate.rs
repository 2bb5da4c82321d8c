//! Event normalization and rename correlation
//!
//! Raw kinds map onto the public taxonomy one to one, except renames: the
//! two halves are held in a bounded table until their partner shows up in
//! the same directory, then merged into a single `Moved`. A half that waits
//! longer than the correlation window, or is evicted because the table is
//! full, is reported on its own (`Removed` for the old name, `Added` for the
//! new one).

use dirwatch_core::{Action, NotifiedEvent, PathKey, RawKind, WatchId};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    From,
    To,
}

#[derive(Debug)]
struct PendingHalf {
    key: PathKey,
    directory: PathBuf,
    filename: String,
    identity: Option<u64>,
    side: Side,
    at: Instant,
}

impl PendingHalf {
    fn degrade(self, watch_id: WatchId) -> NotifiedEvent {
        let action = match self.side {
            Side::From => Action::Removed,
            Side::To => Action::Added,
        };
        NotifiedEvent::new(watch_id, self.directory, self.filename, action)
    }
}

/// Per-watch normalizer holding unmatched rename halves
#[derive(Debug)]
pub struct RenameCorrelator {
    watch_id: WatchId,
    window: Duration,
    capacity: usize,
    /// Arrival order; expiry and eviction walk from the front
    pending: VecDeque<PendingHalf>,
}

impl RenameCorrelator {
    pub fn new(watch_id: WatchId, window: Duration, capacity: usize) -> Self {
        Self {
            watch_id,
            window,
            capacity: capacity.max(1),
            pending: VecDeque::new(),
        }
    }

    /// Normalize one raw event, appending finished events to `out`
    ///
    /// `Overflow` carries no entry and produces nothing.
    pub fn push(
        &mut self,
        directory: PathBuf,
        filename: String,
        kind: RawKind,
        identity: Option<u64>,
        at: Instant,
        out: &mut Vec<NotifiedEvent>,
    ) {
        let action = match kind {
            RawKind::Added => Action::Added,
            RawKind::Removed => Action::Removed,
            RawKind::Modified => Action::Modified,
            RawKind::RenamedFrom => {
                return self.half(directory, filename, Side::From, identity, at, out)
            }
            RawKind::RenamedTo => {
                return self.half(directory, filename, Side::To, identity, at, out)
            }
            RawKind::Overflow => return,
        };
        self.settle(&directory, &filename, out);
        out.push(NotifiedEvent::new(self.watch_id, directory, filename, action));
    }

    /// Report halves still waiting on `filename` before a newer event for it
    fn settle(&mut self, directory: &Path, filename: &str, out: &mut Vec<NotifiedEvent>) {
        if self.pending.is_empty() {
            return;
        }

        let key = PathKey::new(directory);
        let watch_id = self.watch_id;
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for half in self.pending.drain(..) {
            if half.key == key && half.filename == filename {
                trace!("watch {}: settling rename half {}", watch_id, half.filename);
                out.push(half.degrade(watch_id));
            } else {
                kept.push_back(half);
            }
        }
        self.pending = kept;
    }

    fn half(
        &mut self,
        directory: PathBuf,
        filename: String,
        side: Side,
        identity: Option<u64>,
        at: Instant,
        out: &mut Vec<NotifiedEvent>,
    ) {
        // Partners older than the window no longer qualify
        self.expire(at, out);

        let key = PathKey::new(&directory);
        let index = self
            .pending
            .iter()
            .position(|p| p.side != side && p.identity == identity && p.key == key);
        let partner = index.and_then(|index| self.pending.remove(index));

        if let Some(partner) = partner {
            let (old, new) = match side {
                Side::From => (filename, partner.filename),
                Side::To => (partner.filename, filename),
            };
            trace!("watch {}: correlated rename {} -> {}", self.watch_id, old, new);
            out.push(NotifiedEvent::moved(self.watch_id, directory, old, new));
            return;
        }

        if self.pending.len() >= self.capacity {
            if let Some(oldest) = self.pending.pop_front() {
                trace!(
                    "watch {}: rename table full, flushing {}",
                    self.watch_id,
                    oldest.filename
                );
                out.push(oldest.degrade(self.watch_id));
            }
        }

        self.pending.push_back(PendingHalf {
            key,
            directory,
            filename,
            identity,
            side,
            at,
        });
    }

    /// Flush halves that have waited at least the window as of `now`
    pub fn expire(&mut self, now: Instant, out: &mut Vec<NotifiedEvent>) {
        if self.pending.is_empty() {
            return;
        }

        let window = self.window;
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for half in self.pending.drain(..) {
            if now.saturating_duration_since(half.at) >= window {
                out.push(half.degrade(self.watch_id));
            } else {
                kept.push_back(half);
            }
        }
        self.pending = kept;
    }

    /// Flush every pending half regardless of age
    pub fn flush_all(&mut self, out: &mut Vec<NotifiedEvent>) {
        let watch_id = self.watch_id;
        out.extend(self.pending.drain(..).map(|half| half.degrade(watch_id)));
    }

    /// Number of unmatched halves
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
