//! Versioned in-memory cache of calendar events.
//!
//! Every id has a slot holding a version and the event, or a tombstone once
//! the event is removed. A value is only accepted when its version is newer
//! than the slot's, which is the single conflict rule between local writes
//! and poll results.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::trace;

use crate::models::{CalendarEvent, DateRange, EventId};

pub type Version = u64;

#[derive(Debug, Clone)]
struct Slot {
    version: Version,
    event: Option<CalendarEvent>,
}

/// Versions of every slot at one point in time, taken before a provider read
#[derive(Debug, Clone, Default)]
pub struct VersionSnapshot {
    versions: HashMap<EventId, Version>,
}

impl VersionSnapshot {
    /// Version the slot had when the snapshot was taken, 0 for unknown ids
    pub fn version(&self, id: &str) -> Version {
        self.versions.get(id).copied().unwrap_or(0)
    }
}

/// What a reconcile pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub upserted: usize,
    pub removed: usize,
    /// Poll values rejected because a newer local write exists
    pub rejected: usize,
}

#[derive(Debug, Default)]
pub struct EventStore {
    slots: RwLock<HashMap<EventId, Slot>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<CalendarEvent> {
        self.slots.read().get(id).and_then(|s| s.event.clone())
    }

    /// Current version of `id`, 0 when it was never seen
    pub fn version(&self, id: &str) -> Version {
        self.slots.read().get(id).map_or(0, |s| s.version)
    }

    /// Store `event` if `version` is newer than the stored one
    pub fn upsert(&self, event: CalendarEvent, version: Version) -> bool {
        let mut slots = self.slots.write();
        let current = slots.get(&event.id).map_or(0, |s| s.version);
        if version <= current {
            trace!("Discarding {} at version {} (have {})", event.id, version, current);
            return false;
        }
        slots.insert(event.id.clone(), Slot { version, event: Some(event) });
        true
    }

    /// Tombstone `id` if `version` is newer than the stored one
    pub fn remove(&self, id: &str, version: Version) -> bool {
        let mut slots = self.slots.write();
        let current = slots.get(id).map_or(0, |s| s.version);
        if version <= current {
            return false;
        }
        slots.insert(id.to_string(), Slot { version, event: None });
        true
    }

    /// Store a value written by this process, taking the next version
    pub fn write_local(&self, event: CalendarEvent) -> Version {
        let mut slots = self.slots.write();
        let version = slots.get(&event.id).map_or(0, |s| s.version) + 1;
        slots.insert(event.id.clone(), Slot { version, event: Some(event) });
        version
    }

    /// Tombstone `id` locally, taking the next version
    pub fn remove_local(&self, id: &str) -> Version {
        let mut slots = self.slots.write();
        let version = slots.get(id).map_or(0, |s| s.version) + 1;
        slots.insert(id.to_string(), Slot { version, event: None });
        version
    }

    pub fn snapshot(&self) -> VersionSnapshot {
        let versions = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.version))
            .collect();
        VersionSnapshot { versions }
    }

    /// Apply a provider listing of `range` read after `snapshot` was taken.
    ///
    /// Listed events replace cached ones that have not changed since the
    /// snapshot. Cached non-master events in the range that the listing no
    /// longer contains are removed under the same rule. Masters never appear
    /// in listings and are left alone.
    pub fn reconcile(
        &self,
        snapshot: &VersionSnapshot,
        listing: Vec<CalendarEvent>,
        range: &DateRange,
    ) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let mut listed = HashSet::with_capacity(listing.len());

        for event in listing {
            listed.insert(event.id.clone());
            if self.get(&event.id).as_ref() == Some(&event) {
                continue;
            }
            let version = snapshot.version(&event.id) + 1;
            if self.upsert(event, version) {
                stats.upserted += 1;
            } else {
                stats.rejected += 1;
            }
        }

        let vanished: Vec<EventId> = self
            .slots
            .read()
            .iter()
            .filter(|(id, slot)| {
                !listed.contains(*id)
                    && slot
                        .event
                        .as_ref()
                        .is_some_and(|e| !e.is_master() && e.overlaps(range))
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in vanished {
            if self.remove(&id, snapshot.version(&id) + 1) {
                stats.removed += 1;
            } else {
                stats.rejected += 1;
            }
        }
        stats
    }

    /// Cached occurrences and single events overlapping `range`, by start time
    pub fn events(&self, range: &DateRange) -> Vec<CalendarEvent> {
        let mut events: Vec<CalendarEvent> = self
            .slots
            .read()
            .values()
            .filter_map(|s| s.event.as_ref())
            .filter(|e| !e.is_master() && e.overlaps(range))
            .cloned()
            .collect();
        events.sort_by(|a, b| a.start().cmp(&b.start()).then_with(|| a.id.cmp(&b.id)));
        events
    }

    /// Cached occurrences of the series owned by `master_id`
    pub fn series(&self, master_id: &str) -> Vec<CalendarEvent> {
        self.slots
            .read()
            .values()
            .filter_map(|s| s.event.as_ref())
            .filter(|e| e.recurring_event_id() == Some(master_id))
            .cloned()
            .collect()
    }

    pub fn masters(&self) -> Vec<CalendarEvent> {
        self.slots
            .read()
            .values()
            .filter_map(|s| s.event.as_ref())
            .filter(|e| e.is_master())
            .cloned()
            .collect()
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.slots.read().values().filter(|s| s.event.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventDetails;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    fn event(id: &str, title: &str) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            details: EventDetails::new(title, at(9), at(9) + Duration::hours(1)),
            recurrence: None,
            meeting_link: None,
        }
    }

    fn day() -> DateRange {
        DateRange::new(at(0), at(23))
    }

    #[test]
    fn older_versions_are_discarded() {
        let store = EventStore::new();
        assert!(store.upsert(event("a", "new"), 2));
        assert!(!store.upsert(event("a", "old"), 1));
        assert!(!store.upsert(event("a", "same"), 2));
        assert_eq!(store.get("a").unwrap().title(), "new");
    }

    #[test]
    fn tombstones_keep_their_version() {
        let store = EventStore::new();
        store.write_local(event("a", "x"));
        let removed_at = store.remove_local("a");
        assert_eq!(removed_at, 2);
        assert!(store.get("a").is_none());
        assert!(!store.upsert(event("a", "x"), 2));
        assert_eq!(store.version("a"), 2);
    }

    #[test]
    fn poll_results_lose_against_writes_made_during_the_poll() {
        let store = EventStore::new();
        store.write_local(event("a", "before"));
        let snapshot = store.snapshot();

        store.write_local(event("a", "edited"));
        let stats = store.reconcile(&snapshot, vec![event("a", "before")], &day());

        assert_eq!(stats.rejected, 1);
        assert_eq!(store.get("a").unwrap().title(), "edited");
    }

    #[test]
    fn poll_results_cannot_resurrect_local_deletes() {
        let store = EventStore::new();
        store.write_local(event("a", "x"));
        let snapshot = store.snapshot();

        store.remove_local("a");
        store.reconcile(&snapshot, vec![event("a", "x")], &day());

        assert!(store.get("a").is_none());
    }

    #[test]
    fn vanished_events_are_removed_only_inside_the_range() {
        let store = EventStore::new();
        store.write_local(event("gone", "x"));
        let mut elsewhere = event("elsewhere", "y");
        elsewhere.details.start = at(9) + Duration::days(3);
        elsewhere.details.end = elsewhere.details.start + Duration::hours(1);
        store.write_local(elsewhere);

        let snapshot = store.snapshot();
        let stats = store.reconcile(&snapshot, vec![event("fresh", "z")], &day());

        assert_eq!(stats, ReconcileStats { upserted: 1, removed: 1, rejected: 0 });
        assert!(store.get("gone").is_none());
        assert!(store.get("elsewhere").is_some());
        assert!(store.get("fresh").is_some());
    }
}
