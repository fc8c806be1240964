// In-memory event storage
//
// Backing store for writer nodes in tests and for freshly provisioned
// shard groups before a durable backend is attached. Batch append is
// all-or-nothing: the batch is staged against the current record set and
// committed under one lock acquisition.

use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

use super::{
    commit_batch, events_in_range, events_up_to, prepare_batch, EventStorage, LoadBoundary,
    TemporalEventRecord,
};
use crate::error::Result;
use crate::event::Event;

#[derive(Default)]
struct StorageInner {
    records: Vec<TemporalEventRecord>,
    ids: HashSet<Uuid>,
}

#[derive(Default)]
pub struct MemoryEventStorage {
    inner: Mutex<StorageInner>,
}

impl MemoryEventStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStorage for MemoryEventStorage {
    fn persist_events(&self, events: &[Event], ignore_duplicates: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let outcome = prepare_batch(&inner.records, &inner.ids, events, ignore_duplicates)?;
        let StorageInner { records, ids } = &mut *inner;
        commit_batch(records, ids, outcome);
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<TemporalEventRecord>> {
        Ok(self.inner.lock().records.clone())
    }

    fn read_events_up_to(&self, boundary: &LoadBoundary) -> Result<Vec<Event>> {
        events_up_to(&self.inner.lock().records, boundary)
    }

    fn read_range(
        &self,
        range_start: i32,
        range_end: i32,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        Ok(events_in_range(
            &self.inner.lock().records,
            range_start,
            range_end,
            after,
            limit,
        ))
    }

    fn delete_range(&self, range_start: i32, range_end: i32) -> Result<usize> {
        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner.records.retain(|record| {
            record.event.hash_code < range_start || record.event.hash_code > range_end
        });
        let remaining_ids: HashSet<Uuid> = inner.records.iter().map(|r| r.event.id).collect();
        inner.ids = remaining_ids;
        Ok(before - inner.records.len())
    }

    fn event_count(&self) -> Result<usize> {
        Ok(self.inner.lock().records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Fnv1aKeyHasher;
    use crate::event::{EventAction, EventData};
    use crate::model::User;
    use chrono::Utc;

    fn user_event(name: &str) -> Event {
        Event::new(
            EventAction::Add,
            EventData::User { user: User::new(name) },
            Utc::now(),
            &Fnv1aKeyHasher,
        )
    }

    #[test]
    fn test_persist_and_read_back_in_order() {
        let storage = MemoryEventStorage::new();
        let events = vec![user_event("u1"), user_event("u2")];
        storage.persist_events(&events, false).unwrap();

        let records = storage.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.id, events[0].id);
        assert_eq!(records[1].event.id, events[1].id);
        assert_eq!(storage.event_count().unwrap(), 2);
    }

    #[test]
    fn test_reflush_with_ignore_duplicates_is_idempotent() {
        let storage = MemoryEventStorage::new();
        let events = vec![user_event("u1"), user_event("u2")];
        storage.persist_events(&events, false).unwrap();
        storage.persist_events(&events, true).unwrap();
        assert_eq!(storage.event_count().unwrap(), 2);
    }

    #[test]
    fn test_delete_range_removes_only_in_range() {
        let storage = MemoryEventStorage::new();
        let events: Vec<Event> = (0..20).map(|i| user_event(&format!("u{}", i))).collect();
        storage.persist_events(&events, false).unwrap();

        let negative_before = events.iter().filter(|e| e.hash_code < 0).count();
        let removed = storage.delete_range(i32::MIN, -1).unwrap();
        assert_eq!(removed, negative_before);

        let remaining = storage.read_all().unwrap();
        assert!(remaining.iter().all(|r| r.event.hash_code >= 0));
    }
}
