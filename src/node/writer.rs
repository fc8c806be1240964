// Writer node
//
// The event-generating half of a shard group. Incoming changes are
// validated against the shadow store, stamped and buffered; flushed batches
// land in persistent storage and the event cache in one sink. The buffered
// count is the drain signal the split orchestrator polls, and the collision
// counters account for duplicate primary-element events received while two
// ranges are being merged.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::common::{KeyHasher, TripSwitch};
use crate::config::{FlushStrategyKind, NodeConfig};
use crate::error::{AccessError, Result};
use crate::event::buffer::{EventSink, FlushWorker, TemporalEventBuffer};
use crate::event::cache::EventCache;
use crate::event::validator::EventValidator;
use crate::event::{Event, EventAction, EventData};
use crate::storage::{EventStorage, LoadBoundary, PersistentReader};

/// Flushed batches go to storage first and only then become observable in
/// the cache.
struct PersistAndCacheSink {
    storage: Arc<dyn EventStorage>,
    cache: Arc<EventCache>,
}

impl EventSink for PersistAndCacheSink {
    fn accept(&self, events: &[Event]) -> Result<()> {
        // a retried batch may contain already-persisted events
        self.storage.persist_events(events, true)?;
        self.cache.append_batch(events);
        Ok(())
    }
}

pub struct WriterNode {
    buffer: Arc<TemporalEventBuffer>,
    storage: Arc<dyn EventStorage>,
    cache: Arc<EventCache>,
    trip: Arc<TripSwitch>,
    strategy: FlushStrategyKind,
    flush_interval: std::time::Duration,
    /// Tolerate duplicate primary-element events instead of failing them.
    /// Enabled on the surviving writer while shard groups are merged.
    collision_tolerant: AtomicBool,
    invalid_add_events: AtomicU64,
    invalid_remove_events: AtomicU64,
    flush_worker: Mutex<Option<FlushWorker>>,
}

impl WriterNode {
    /// Build a writer over (possibly non-empty) storage. The validator
    /// shadow is seeded by replaying whatever is already persisted.
    pub fn new(
        config: &NodeConfig,
        storage: Arc<dyn EventStorage>,
        hasher: Arc<dyn KeyHasher>,
        trip: Arc<TripSwitch>,
    ) -> Result<Arc<Self>> {
        let validator = if storage.event_count()? > 0 {
            let reader =
                PersistentReader::new(storage.clone(), config.store_bidirectional_mappings);
            let (shadow, result) = reader.load(&LoadBoundary::Latest)?;
            tracing::info!(
                "writer validator shadow seeded from {} persisted events",
                result.applied
            );
            EventValidator::with_shadow(shadow)
        } else {
            EventValidator::new(config.store_bidirectional_mappings)
        };

        let cache = Arc::new(EventCache::new(config.cache.capacity));
        let sink = Arc::new(PersistAndCacheSink {
            storage: storage.clone(),
            cache: cache.clone(),
        });
        let buffer = Arc::new(TemporalEventBuffer::new(
            validator,
            sink,
            &config.buffer,
            hasher,
            trip.clone(),
        ));

        Ok(Arc::new(Self {
            buffer,
            storage,
            cache,
            trip,
            strategy: config.buffer.strategy,
            flush_interval: config.buffer.flush_interval(),
            collision_tolerant: AtomicBool::new(false),
            invalid_add_events: AtomicU64::new(0),
            invalid_remove_events: AtomicU64::new(0),
            flush_worker: Mutex::new(None),
        }))
    }

    /// Validate, stamp and buffer one change. Returns the primary event id,
    /// or `None` for a collision dropped in collision-tolerant mode.
    pub fn process(&self, action: EventAction, data: EventData) -> Result<Option<Uuid>> {
        match self.buffer.buffer(action, data.clone()) {
            Ok(id) => Ok(Some(id)),
            Err(error) if self.is_tolerated_collision(action, &data, &error) => {
                self.count_collision(action);
                tracing::warn!("dropped colliding primary-element event: {}", error);
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Ingest pre-formed events (range copy, router release), preserving
    /// ids and timestamps. Accepted events are persisted and cached
    /// directly; colliding primary events are counted and dropped.
    pub fn ingest(&self, events: Vec<Event>) -> Result<usize> {
        self.trip.guard()?;
        let mut accepted = Vec::with_capacity(events.len());
        for event in events {
            match self.buffer.absorb_external(&event) {
                Ok(()) => accepted.push(event),
                Err(error)
                    if self.is_tolerated_collision(event.action, &event.data, &error) =>
                {
                    self.count_collision(event.action);
                    tracing::warn!("dropped colliding ingested event '{}': {}", event.id, error);
                }
                Err(error) => return Err(error),
            }
        }
        if !accepted.is_empty() {
            self.storage.persist_events(&accepted, true)?;
            self.cache.append_batch(&accepted);
        }
        Ok(accepted.len())
    }

    fn is_tolerated_collision(
        &self,
        action: EventAction,
        data: &EventData,
        error: &AccessError,
    ) -> bool {
        if !self.collision_tolerant.load(Ordering::SeqCst) || !data.kind().is_primary_element() {
            return false;
        }
        match action {
            EventAction::Add => matches!(error, AccessError::AlreadyExists(_)),
            EventAction::Remove => matches!(
                error,
                AccessError::NotFound(_)
                    | AccessError::UserNotFound(_)
                    | AccessError::GroupNotFound(_)
                    | AccessError::EntityTypeNotFound(_)
                    | AccessError::EntityNotFound(_, _)
            ),
        }
    }

    fn count_collision(&self, action: EventAction) {
        match action {
            EventAction::Add => self.invalid_add_events.fetch_add(1, Ordering::SeqCst),
            EventAction::Remove => self.invalid_remove_events.fetch_add(1, Ordering::SeqCst),
        };
    }

    pub fn set_collision_tolerant(&self, tolerant: bool) {
        self.collision_tolerant.store(tolerant, Ordering::SeqCst);
    }

    pub fn invalid_add_primary_element_events_received(&self) -> u64 {
        self.invalid_add_events.load(Ordering::SeqCst)
    }

    pub fn invalid_remove_primary_element_events_received(&self) -> u64 {
        self.invalid_remove_events.load(Ordering::SeqCst)
    }

    /// Buffered, not-yet-flushed event count; the orchestrator's drain
    /// phase waits for this to reach zero.
    pub fn event_processing_count(&self) -> usize {
        self.buffer.buffered_count()
    }

    pub fn consecutive_flush_failures(&self) -> u32 {
        self.buffer.consecutive_flush_failures()
    }

    pub fn flush(&self) -> Result<usize> {
        self.buffer.flush()
    }

    pub fn cache(&self) -> Arc<EventCache> {
        self.cache.clone()
    }

    pub fn storage(&self) -> Arc<dyn EventStorage> {
        self.storage.clone()
    }

    /// Start the periodic flush worker when the strategy asks for one.
    pub fn start(self: &Arc<Self>) {
        if matches!(
            self.strategy,
            FlushStrategyKind::Looping | FlushStrategyKind::Hybrid
        ) {
            let worker = FlushWorker::start(self.buffer.clone(), self.flush_interval);
            *self.flush_worker.lock() = Some(worker);
        }
    }

    /// Stop the flush worker, completing a final flush of pending events.
    pub async fn stop(&self) {
        let worker = self.flush_worker.lock().take();
        if let Some(worker) = worker {
            worker.stop().await;
        } else if let Err(e) = self.flush() {
            tracing::error!("final flush on stop failed: {}", e);
        }
    }
}
