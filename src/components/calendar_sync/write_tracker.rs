//! Per-series write serialization.
//!
//! One async mutex per series key; map entries are dropped as soon as no
//! writer holds or waits for them. The time range of every pending write is
//! recorded so the poller can avoid racing it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use crate::models::DateRange;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct WriteTracker {
    locks: Mutex<HashMap<String, KeyLock>>,
    pending: Mutex<HashMap<u64, DateRange>>,
    next_ticket: AtomicU64,
}

/// Registration of a pending write's range, removed on drop
struct PendingRange {
    tracker: Arc<WriteTracker>,
    ticket: u64,
}

impl Drop for PendingRange {
    fn drop(&mut self) {
        self.tracker.pending.lock().remove(&self.ticket);
    }
}

/// Held for the duration of one write
pub struct WriteGuard {
    key: String,
    lock: KeyLock,
    guard: Option<OwnedMutexGuard<()>>,
    pending: PendingRange,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.pending.tracker.locks.lock();
        // The map's reference plus ours: nobody else is waiting
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
            trace!("Released idle write lock {}", self.key);
        }
    }
}

impl WriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other write for `key` is in flight, then hold the key.
    /// `range` counts as in flight from the moment this is called.
    pub async fn begin(self: &Arc<Self>, key: &str, range: DateRange) -> WriteGuard {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(ticket, range);
        let pending = PendingRange { tracker: Arc::clone(self), ticket };

        let lock = Arc::clone(self.locks.lock().entry(key.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        trace!("Acquired write lock {}", key);

        WriteGuard { key: key.to_string(), lock, guard: Some(guard), pending }
    }

    /// Whether any pending write touches `range`
    pub fn overlaps(&self, range: &DateRange) -> bool {
        self.pending.lock().values().any(|r| r.intersects(range))
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of keys currently locked or waited on
    pub fn active_keys(&self) -> usize {
        self.locks.lock().len()
    }
}
