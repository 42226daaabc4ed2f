//! Event storage.
//!
//! Collections are keyed by event id. `add_event`/`change_event` are both
//! upserts, which makes out-of-order completion race-safe: a completion
//! only ever touches its own id. Snapshots returned by `get_events` are
//! independent of later mutation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::event::PerfEvent;

/// Storage contract for perf events.
pub trait PerfCollection: Send + Sync {
    /// Maximum number of retained events; `None` for unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Events evicted (or refused) because of the capacity policy.
    fn dropped_messages(&self) -> u64;

    /// Adjust capacity; may evict immediately. No-op on unbounded
    /// collections.
    fn change_capacity(&self, size: usize);

    fn get_event(&self, id: i64) -> Option<PerfEvent>;

    /// Point-in-time snapshot in id (insertion) order. Later mutation of
    /// the collection does not affect a snapshot already handed out.
    fn get_events(&self) -> Vec<PerfEvent>;

    /// Upsert keyed by `event.id`.
    fn add_event(&self, event: PerfEvent);

    /// Upsert keyed by `id`. Idempotent: applying the same event twice
    /// leaves the collection in the same observable state.
    fn change_event(&self, id: i64, event: PerfEvent) -> bool;

    /// Delete by id; returns whether the id was present.
    fn remove_event(&self, id: i64) -> bool;
}

/// Unbounded in-memory collection. The default for deployments that pull
/// events off frequently.
#[derive(Default)]
pub struct UnboundedPerfCollection {
    events: Mutex<BTreeMap<i64, PerfEvent>>,
    dropped: AtomicU64,
}

impl UnboundedPerfCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PerfCollection for UnboundedPerfCollection {
    fn capacity(&self) -> Option<usize> {
        None
    }

    fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn change_capacity(&self, _size: usize) {}

    fn get_event(&self, id: i64) -> Option<PerfEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn get_events(&self) -> Vec<PerfEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn add_event(&self, event: PerfEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.id, event);
    }

    fn change_event(&self, id: i64, event: PerfEvent) -> bool {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, event);
        true
    }

    fn remove_event(&self, id: i64) -> bool {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }
}

struct BoundedState {
    events: BTreeMap<i64, PerfEvent>,
    capacity: usize,
    dropped: u64,
}

impl BoundedState {
    fn evict_over_capacity(&mut self) {
        while self.events.len() > self.capacity {
            // BTreeMap keeps id order, so first entry is the oldest.
            if let Some((&oldest, _)) = self.events.iter().next() {
                self.events.remove(&oldest);
                self.dropped += 1;
            } else {
                break;
            }
        }
    }
}

/// Capacity-limited collection: evicts oldest-first and counts drops.
pub struct BoundedPerfCollection {
    state: Mutex<BoundedState>,
}

impl BoundedPerfCollection {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BoundedState {
                events: BTreeMap::new(),
                capacity,
                dropped: 0,
            }),
        }
    }
}

impl PerfCollection for BoundedPerfCollection {
    fn capacity(&self) -> Option<usize> {
        Some(self.state.lock().unwrap_or_else(|e| e.into_inner()).capacity)
    }

    fn dropped_messages(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }

    fn change_capacity(&self, size: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.capacity = size;
        state.evict_over_capacity();
    }

    fn get_event(&self, id: i64) -> Option<PerfEvent> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .get(&id)
            .cloned()
    }

    fn get_events(&self) -> Vec<PerfEvent> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .values()
            .cloned()
            .collect()
    }

    fn add_event(&self, event: PerfEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.events.insert(event.id, event);
        state.evict_over_capacity();
    }

    fn change_event(&self, id: i64, event: PerfEvent) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.events.insert(id, event);
        state.evict_over_capacity();
        true
    }

    fn remove_event(&self, id: i64) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .remove(&id)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::event::{PerfDomain, PerfStatus};
    use chrono::Utc;

    fn event(id: i64) -> PerfEvent {
        PerfEvent {
            id,
            date: Utc::now(),
            status: PerfStatus::Pending,
            domain: PerfDomain::Interop,
            ipc: true,
            metadata: None,
            error: None,
            params: None,
            params_size: None,
            result: None,
            result_size: None,
            elapsed: None,
        }
    }

    #[test]
    fn test_snapshot_isolation() {
        let collection = UnboundedPerfCollection::new();
        collection.add_event(event(0));
        collection.add_event(event(1));

        let snapshot = collection.get_events();
        collection.remove_event(0);
        collection.add_event(event(2));
        let mut changed = event(1);
        changed.status = PerfStatus::Completed;
        collection.change_event(1, changed);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, 0);
        assert_eq!(snapshot[1].status, PerfStatus::Pending);
    }

    #[test]
    fn test_change_event_upsert_idempotent() {
        let collection = UnboundedPerfCollection::new();
        let mut e = event(5);
        e.status = PerfStatus::Completed;

        // Upsert on an unknown id inserts.
        collection.change_event(5, e.clone());
        let once = collection.get_events();

        collection.change_event(5, e);
        let twice = collection.get_events();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn test_events_returned_in_id_order() {
        let collection = UnboundedPerfCollection::new();
        collection.add_event(event(2));
        collection.add_event(event(0));
        collection.add_event(event(1));
        let ids: Vec<i64> = collection.get_events().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_bounded_evicts_oldest_first() {
        let collection = BoundedPerfCollection::new(2);
        for id in 0..5 {
            collection.add_event(event(id));
        }
        let ids: Vec<i64> = collection.get_events().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(collection.dropped_messages(), 3);
    }

    #[test]
    fn test_bounded_change_capacity_evicts() {
        let collection = BoundedPerfCollection::new(4);
        for id in 0..4 {
            collection.add_event(event(id));
        }
        collection.change_capacity(1);
        assert_eq!(collection.capacity(), Some(1));
        let ids: Vec<i64> = collection.get_events().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3]);
        assert_eq!(collection.dropped_messages(), 3);
    }
}
