// Persistent reader
//
// Rehydrates an authorization store by replaying persisted events up to a
// chosen boundary. Used by reader nodes on startup and on a cache miss,
// and by writer nodes to seed the validator shadow after a restart.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::{EventStorage, LoadBoundary};
use crate::error::{AccessError, Result};
use crate::store::AccessStore;

/// Where a load ended: the last replayed event and how many were applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadResult {
    pub last_event_id: Uuid,
    pub last_event_at: DateTime<Utc>,
    pub applied: usize,
}

pub struct PersistentReader {
    storage: Arc<dyn EventStorage>,
    store_bidirectional_mappings: bool,
}

impl PersistentReader {
    pub fn new(storage: Arc<dyn EventStorage>, store_bidirectional_mappings: bool) -> Self {
        Self {
            storage,
            store_bidirectional_mappings,
        }
    }

    /// Replay persisted events into a fresh store up to the boundary.
    /// `PersistentStorageEmpty` when nothing has been persisted.
    pub fn load(&self, boundary: &LoadBoundary) -> Result<(AccessStore, LoadResult)> {
        let events = self.storage.read_events_up_to(boundary)?;
        let last = events
            .last()
            .ok_or(AccessError::PersistentStorageEmpty)?
            .clone();

        let mut store = AccessStore::new(self.store_bidirectional_mappings);
        for event in &events {
            store.apply(event.action, &event.data).map_err(|e| {
                AccessError::Storage(format!(
                    "persisted event '{}' failed to replay: {}",
                    event.id, e
                ))
            })?;
        }
        Ok((
            store,
            LoadResult {
                last_event_id: last.id,
                last_event_at: last.occurred_at,
                applied: events.len(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Fnv1aKeyHasher;
    use crate::event::{Event, EventAction, EventData};
    use crate::model::{Group, User};
    use crate::storage::MemoryEventStorage;

    fn seeded_storage() -> (Arc<MemoryEventStorage>, Vec<Event>) {
        let storage = Arc::new(MemoryEventStorage::new());
        let hasher = Fnv1aKeyHasher;
        let events = vec![
            Event::new(
                EventAction::Add,
                EventData::User { user: User::new("u1") },
                Utc::now(),
                &hasher,
            ),
            Event::new(
                EventAction::Add,
                EventData::Group { group: Group::new("g1") },
                Utc::now(),
                &hasher,
            ),
            Event::new(
                EventAction::Add,
                EventData::UserToGroup {
                    user: User::new("u1"),
                    group: Group::new("g1"),
                },
                Utc::now(),
                &hasher,
            ),
        ];
        storage.persist_events(&events, false).unwrap();
        (storage, events)
    }

    #[test]
    fn test_load_latest_replays_everything() {
        let (storage, events) = seeded_storage();
        let reader = PersistentReader::new(storage, true);
        let (store, result) = reader.load(&LoadBoundary::Latest).unwrap();

        assert_eq!(result.applied, 3);
        assert_eq!(result.last_event_id, events[2].id);
        assert!(store
            .get_user_to_group_mappings(&User::new("u1"), false)
            .unwrap()
            .contains(&Group::new("g1")));
    }

    #[test]
    fn test_load_up_to_event_id_stops_at_boundary() {
        let (storage, events) = seeded_storage();
        let reader = PersistentReader::new(storage, true);
        let (store, result) = reader
            .load(&LoadBoundary::UpToEventId(events[1].id))
            .unwrap();

        assert_eq!(result.applied, 2);
        assert_eq!(result.last_event_id, events[1].id);
        assert!(store.contains_group(&Group::new("g1")));
        assert!(store
            .get_user_to_group_mappings(&User::new("u1"), false)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_empty_storage_error() {
        let reader = PersistentReader::new(Arc::new(MemoryEventStorage::new()), true);
        let err = reader.load(&LoadBoundary::Latest).unwrap_err();
        assert!(matches!(err, AccessError::PersistentStorageEmpty));
    }
}
