// Concurrent store wrapper
//
// Reader nodes serve queries from any task while the refresh loop applies
// events; writers validate against their own shadow copy. A single
// reader/writer lock over the store gives parallel readers and exclusive
// writers; the borrow checker makes the graph and mapping tables a single
// owner, so there is no separate per-collection lock to order.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::AccessStore;
use crate::error::Result;
use crate::event::{Event, EventAction, EventData};

pub struct ConcurrentAccessStore {
    inner: RwLock<AccessStore>,
}

impl ConcurrentAccessStore {
    pub fn new(store_bidirectional_mappings: bool) -> Self {
        Self {
            inner: RwLock::new(AccessStore::new(store_bidirectional_mappings)),
        }
    }

    pub fn from_store(store: AccessStore) -> Self {
        Self {
            inner: RwLock::new(store),
        }
    }

    /// Shared read access for queries. Critical sections are short; hold the
    /// guard only for the duration of one query.
    pub fn read(&self) -> RwLockReadGuard<'_, AccessStore> {
        self.inner.read()
    }

    /// Exclusive access for event application.
    pub fn write(&self) -> RwLockWriteGuard<'_, AccessStore> {
        self.inner.write()
    }

    pub fn apply(&self, action: EventAction, data: &EventData) -> Result<()> {
        self.inner.write().apply(action, data)
    }

    /// Apply a batch under a single write acquisition, preserving order.
    pub fn apply_batch(&self, events: &[Event]) -> Result<()> {
        let mut store = self.inner.write();
        for event in events {
            store.apply(event.action, &event.data)?;
        }
        Ok(())
    }

    /// Swap in a freshly loaded store. Used by the reader's cache-miss
    /// fallback path, where the local copy is rebuilt from persistent
    /// storage.
    pub fn replace(&self, store: AccessStore) {
        *self.inner.write() = store;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Group, User};
    use std::sync::Arc;

    #[test]
    fn test_parallel_readers_during_writes() {
        let store = Arc::new(ConcurrentAccessStore::new(true));
        store
            .apply(EventAction::Add, &EventData::User { user: User::new("u0") })
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    let user = User::new(format!("u{}-{}", i, j));
                    store
                        .apply(EventAction::Add, &EventData::User { user })
                        .unwrap();
                    // interleaved reads must always see a consistent store
                    let guard = store.read();
                    assert!(guard.contains_user(&User::new("u0")));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.read().get_users().len(), 201);
    }

    #[test]
    fn test_replace_swaps_contents() {
        let store = ConcurrentAccessStore::new(true);
        store
            .apply(EventAction::Add, &EventData::User { user: User::new("old") })
            .unwrap();

        let mut fresh = AccessStore::new(true);
        fresh.add_group(Group::new("g1")).unwrap();
        store.replace(fresh);

        assert!(!store.read().contains_user(&User::new("old")));
        assert!(store.read().contains_group(&Group::new("g1")));
    }
}
