// Reader node
//
// Maintains a local authorization store and the id of the last applied
// event. The refresh loop pulls the cached suffix after that id and replays
// it through the store's fast path; a cache miss (the id fell out of the
// retained window) falls back to a full load from persistent storage.
// Queries are served from the local store by any task; refresh runs on one.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::TripSwitch;
use crate::config::NodeConfig;
use crate::error::{AccessError, Result};
use crate::event::cache::EventCache;
use crate::event::Event;
use crate::network::protocol::{Query, QueryReply};
use crate::storage::{EventStorage, LoadBoundary, PersistentReader};
use crate::store::ConcurrentAccessStore;

/// Where a reader pulls recent events from: the local event cache
/// in-process, or a remote node's cache-pull RPC.
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn events_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>>;
}

#[async_trait]
impl EventFeed for EventCache {
    async fn events_since(&self, prior_event_id: Option<Uuid>) -> Result<Vec<Event>> {
        self.get_all_since(prior_event_id)
    }
}

pub struct ReaderNode {
    store: Arc<ConcurrentAccessStore>,
    feed: Arc<dyn EventFeed>,
    persistent: PersistentReader,
    last_applied: Mutex<Option<Uuid>>,
    refresh_failures: AtomicU32,
    refresh_failure_limit: u32,
    refresh_interval: Duration,
    trip: Arc<TripSwitch>,
    worker: Mutex<Option<RefreshWorker>>,
}

impl ReaderNode {
    /// Build a reader over the given feed and storage, loading whatever is
    /// already persisted.
    pub fn new(
        config: &NodeConfig,
        feed: Arc<dyn EventFeed>,
        storage: Arc<dyn EventStorage>,
        trip: Arc<TripSwitch>,
    ) -> Result<Arc<Self>> {
        let persistent = PersistentReader::new(storage, config.store_bidirectional_mappings);
        let (store, last_applied) = match persistent.load(&LoadBoundary::Latest) {
            Ok((store, result)) => {
                tracing::info!("reader loaded {} persisted events", result.applied);
                (store, Some(result.last_event_id))
            }
            Err(AccessError::PersistentStorageEmpty) => (
                crate::store::AccessStore::new(config.store_bidirectional_mappings),
                None,
            ),
            Err(e) => return Err(e),
        };
        Ok(Arc::new(Self {
            store: Arc::new(ConcurrentAccessStore::from_store(store)),
            feed,
            persistent,
            last_applied: Mutex::new(last_applied),
            refresh_failures: AtomicU32::new(0),
            refresh_failure_limit: config.refresh_failure_limit,
            refresh_interval: config.refresh_interval(),
            trip,
            worker: Mutex::new(None),
        }))
    }

    pub fn store(&self) -> Arc<ConcurrentAccessStore> {
        self.store.clone()
    }

    pub fn last_applied_event_id(&self) -> Option<Uuid> {
        *self.last_applied.lock()
    }

    /// One refresh cycle: pull the cached suffix and replay it, falling
    /// back to a full load when the cache no longer retains our position.
    /// Returns the number of events applied.
    pub async fn refresh(&self) -> Result<usize> {
        let prior = self.last_applied_event_id();
        let outcome = match self.feed.events_since(prior).await {
            Ok(events) => self.apply_events(events),
            Err(AccessError::EventNotCached(_)) => self.reload(),
            Err(AccessError::EventCacheEmpty) => {
                // nothing has been cached since the cache came up; if we
                // already hold replayed state there is nothing newer to pull
                Ok(0)
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(applied) => {
                self.refresh_failures.store(0, Ordering::SeqCst);
                Ok(applied)
            }
            Err(e) => {
                let failures = self.refresh_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::error!("reader refresh failed ({} consecutive): {}", failures, e);
                if failures >= self.refresh_failure_limit {
                    self.trip
                        .trip(format!("reader refresh failed persistently: {}", e));
                }
                Err(e)
            }
        }
    }

    fn apply_events(&self, events: Vec<Event>) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let applied = events.len();
        // non-validating fast path; order as served by the cache
        self.store.apply_batch(&events)?;
        *self.last_applied.lock() = events.last().map(|event| event.id);
        tracing::debug!("reader applied {} events", applied);
        Ok(applied)
    }

    fn reload(&self) -> Result<usize> {
        let (store, result) = self.persistent.load(&LoadBoundary::Latest)?;
        tracing::info!(
            "cache miss: reader reloaded {} events from persistent storage",
            result.applied
        );
        self.store.replace(store);
        *self.last_applied.lock() = Some(result.last_event_id);
        Ok(result.applied)
    }

    /// Serve one query from the local store. Fails fast once the trip
    /// switch has fired.
    pub fn execute_query(&self, query: &Query) -> Result<QueryReply> {
        self.trip.guard()?;
        super::execute_query(&self.store.read(), query)
    }

    /// Start the periodic refresh loop.
    pub fn start(self: &Arc<Self>) {
        let worker = RefreshWorker::start(self.clone(), self.refresh_interval);
        *self.worker.lock() = Some(worker);
    }

    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop().await;
        }
    }
}

/// Background task driving the periodic refresh.
pub struct RefreshWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshWorker {
    pub fn start(reader: Arc<ReaderNode>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reader.refresh().await {
                            tracing::warn!("periodic refresh failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Fnv1aKeyHasher;
    use crate::event::{EventAction, EventData};
    use crate::model::User;
    use crate::storage::MemoryEventStorage;
    use chrono::Utc;

    fn user_event(name: &str) -> Event {
        Event::new(
            EventAction::Add,
            EventData::User { user: User::new(name) },
            Utc::now(),
            &Fnv1aKeyHasher,
        )
    }

    fn reader_over(
        cache: Arc<EventCache>,
        storage: Arc<MemoryEventStorage>,
    ) -> Arc<ReaderNode> {
        ReaderNode::new(
            &NodeConfig::default(),
            cache,
            storage,
            Arc::new(TripSwitch::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_applies_cached_suffix() {
        let cache = Arc::new(EventCache::new(100));
        let storage = Arc::new(MemoryEventStorage::new());
        let reader = reader_over(cache.clone(), storage.clone());

        let events = vec![user_event("u1"), user_event("u2")];
        storage.persist_events(&events, false).unwrap();
        cache.append_batch(&events);

        let applied = reader.refresh().await.unwrap();
        assert_eq!(applied, 2);
        assert_eq!(reader.last_applied_event_id(), Some(events[1].id));
        assert!(reader.store().read().contains_user(&User::new("u1")));

        // caught up: the next cycle applies nothing
        assert_eq!(reader.refresh().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_falls_back_to_full_load() {
        let cache = Arc::new(EventCache::new(2));
        let storage = Arc::new(MemoryEventStorage::new());

        let first = vec![user_event("u1")];
        storage.persist_events(&first, false).unwrap();
        cache.append_batch(&first);

        let reader = reader_over(cache.clone(), storage.clone());
        reader.refresh().await.unwrap();
        assert_eq!(reader.last_applied_event_id(), Some(first[0].id));

        // two more events evict u1's entry from the capacity-2 cache
        let more = vec![user_event("u2"), user_event("u3")];
        storage.persist_events(&more, false).unwrap();
        cache.append_batch(&more);

        let applied = reader.refresh().await.unwrap();
        assert_eq!(applied, 3, "full reload replays everything");
        assert_eq!(reader.last_applied_event_id(), Some(more[1].id));
        let store = reader.store();
        let guard = store.read();
        assert!(guard.contains_user(&User::new("u1")));
        assert!(guard.contains_user(&User::new("u3")));
    }

    #[tokio::test]
    async fn test_empty_cache_is_not_an_error() {
        let cache = Arc::new(EventCache::new(10));
        let storage = Arc::new(MemoryEventStorage::new());
        let reader = reader_over(cache, storage);
        assert_eq!(reader.refresh().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repeated_refresh_failure_trips_switch() {
        struct FailingFeed;

        #[async_trait]
        impl EventFeed for FailingFeed {
            async fn events_since(&self, _prior: Option<Uuid>) -> Result<Vec<Event>> {
                Err(AccessError::Network("feed unreachable".to_string()))
            }
        }

        let trip = Arc::new(TripSwitch::new());
        let config = NodeConfig {
            refresh_failure_limit: 2,
            ..NodeConfig::default()
        };
        let reader = ReaderNode::new(
            &config,
            Arc::new(FailingFeed),
            Arc::new(MemoryEventStorage::new()),
            trip.clone(),
        )
        .unwrap();

        assert!(reader.refresh().await.is_err());
        assert!(!trip.is_tripped());
        assert!(reader.refresh().await.is_err());
        assert!(trip.is_tripped());

        let err = reader.execute_query(&Query::GetUsers).unwrap_err();
        assert!(matches!(err, AccessError::ServiceUnavailable(_)));
    }
}
