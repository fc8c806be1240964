// Event cache
//
// A bounded ring of the most recently persisted events, in persistence
// order. Readers pull the suffix after their last applied event id; a miss
// (the id has been evicted) tells the reader to fall back to a full load
// from persistent storage. Eviction is strict FIFO at the configured
// capacity.

use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use crate::error::{AccessError, Result};
use crate::event::Event;

pub struct EventCache {
    capacity: usize,
    inner: RwLock<CacheInner>,
}

struct CacheInner {
    ring: VecDeque<Event>,
    ids: HashSet<Uuid>,
    /// distinguishes an empty cache that was never populated from one whose
    /// contents were fully evicted
    populated: bool,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(CacheInner {
                ring: VecDeque::new(),
                ids: HashSet::new(),
                populated: false,
            }),
        }
    }

    /// Append a persisted batch in persistence order, evicting from the
    /// front once over capacity.
    pub fn append_batch(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        inner.populated = true;
        for event in events {
            inner.ring.push_back(event.clone());
            inner.ids.insert(event.id);
            while inner.ring.len() > self.capacity {
                if let Some(evicted) = inner.ring.pop_front() {
                    inner.ids.remove(&evicted.id);
                }
            }
        }
    }

    /// The suffix of cached events strictly after `prior_event_id`, or the
    /// whole retained window when no prior id is supplied.
    ///
    /// Errors: `EventCacheEmpty` when nothing was ever cached;
    /// `EventNotCached` when the prior id predates the retained window.
    pub fn get_all_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>> {
        let inner = self.inner.read();
        if !inner.populated {
            return Err(AccessError::EventCacheEmpty);
        }
        match prior_event_id {
            None => Ok(inner.ring.iter().cloned().collect()),
            Some(prior) => {
                if !inner.ids.contains(&prior) {
                    return Err(AccessError::EventNotCached(prior));
                }
                let position = inner
                    .ring
                    .iter()
                    .position(|event| event.id == prior)
                    .expect("id set and ring agree");
                Ok(inner.ring.iter().skip(position + 1).cloned().collect())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().ring.is_empty()
    }

    /// Id of the most recently cached event, if any.
    pub fn latest_id(&self) -> Option<Uuid> {
        self.inner.read().ring.back().map(|event| event.id)
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
    fn test_empty_cache_error() {
        let cache = EventCache::new(10);
        let err = cache.get_all_since(None).unwrap_err();
        assert!(matches!(err, AccessError::EventCacheEmpty));
    }

    #[test]
    fn test_suffix_after_prior_id() {
        let cache = EventCache::new(10);
        let events: Vec<Event> = (0..3).map(|i| user_event(&format!("u{}", i))).collect();
        cache.append_batch(&events);

        let since = cache.get_all_since(Some(events[0].id)).unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].id, events[1].id);
        assert_eq!(since[1].id, events[2].id);

        // caught-up reader gets an empty suffix
        let since = cache.get_all_since(Some(events[2].id)).unwrap();
        assert!(since.is_empty());
    }

    #[test]
    fn test_fifo_eviction_and_miss() {
        let cache = EventCache::new(2);
        let events: Vec<Event> = (0..3).map(|i| user_event(&format!("u{}", i))).collect();
        cache.append_batch(&events);

        assert_eq!(cache.len(), 2);
        // e1 was evicted; a reader still at e1 must be told to reload
        let err = cache.get_all_since(Some(events[0].id)).unwrap_err();
        assert!(matches!(err, AccessError::EventNotCached(id) if id == events[0].id));

        // the retained suffix is still served
        let since = cache.get_all_since(Some(events[1].id)).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, events[2].id);
    }

    #[test]
    fn test_latest_id_tracks_appends() {
        let cache = EventCache::new(10);
        assert_eq!(cache.latest_id(), None);
        let batch = vec![user_event("u1"), user_event("u2")];
        cache.append_batch(&batch);
        assert_eq!(cache.latest_id(), Some(batch[1].id));
    }
}
