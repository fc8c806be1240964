// # Temporal Event Buffer
//
// One FIFO queue per event category. `buffer` validates the change, stamps
// the header (id, occurredAt, hashCode) under a single store-wide lock, and
// appends to the category queue; cascaded removes are enqueued ahead of
// their primary. `flush` swaps all queues out in one critical section and
// replays the merged sequence to the sink in global occurredAt order, ties
// broken by a deterministic category priority and insertion sequence.
//
// A failed flush retains the batch for retry; repeated failures trip the
// switch.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::{KeyHasher, TripSwitch};
use crate::config::{BufferConfig, FlushStrategyKind};
use crate::error::{AccessError, Result};
use crate::event::validator::EventValidator;
use crate::event::{tick, Event, EventAction, EventData, EventKind};

/// Downstream receiver of a flushed batch. The writer node's sink persists
/// the batch and appends it to the event cache.
pub trait EventSink: Send + Sync {
    fn accept(&self, events: &[Event]) -> Result<()>;
}

/// Callback invoked when a size-triggered flush fails inside `buffer`;
/// the failure is reported out-of-band because the buffering call itself
/// has already succeeded.
pub type FlushFailureHandler = Arc<dyn Fn(&AccessError) + Send + Sync>;

struct BufferedEvent {
    event: Event,
    sequence: u64,
}

struct BufferState {
    validator: EventValidator,
    queues: HashMap<EventKind, VecDeque<BufferedEvent>>,
    last_occurred_at: DateTime<Utc>,
    next_sequence: u64,
}

impl BufferState {
    fn enqueue(&mut self, action: EventAction, data: EventData, hasher: &dyn KeyHasher) -> Uuid {
        let now = Utc::now();
        let floor = self.last_occurred_at + tick();
        let occurred_at = if now > floor { now } else { floor };
        self.last_occurred_at = occurred_at;

        let event = Event::new(action, data, occurred_at, hasher);
        let id = event.id;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queues
            .get_mut(&event.kind())
            .expect("queue exists for every kind")
            .push_back(BufferedEvent { event, sequence });
        id
    }
}

pub struct TemporalEventBuffer {
    state: Mutex<BufferState>,
    sink: Arc<dyn EventSink>,
    strategy: FlushStrategyKind,
    size_limit: usize,
    flush_failure_limit: u32,
    /// Serializes flushes; at most one runs at a time.
    flush_mutex: Mutex<()>,
    buffered: AtomicUsize,
    consecutive_failures: AtomicU32,
    flush_failure_handler: RwLock<Option<FlushFailureHandler>>,
    hasher: Arc<dyn KeyHasher>,
    trip: Arc<TripSwitch>,
}

impl TemporalEventBuffer {
    pub fn new(
        validator: EventValidator,
        sink: Arc<dyn EventSink>,
        config: &BufferConfig,
        hasher: Arc<dyn KeyHasher>,
        trip: Arc<TripSwitch>,
    ) -> Self {
        let queues = EventKind::ALL
            .iter()
            .map(|kind| (*kind, VecDeque::new()))
            .collect();
        Self {
            state: Mutex::new(BufferState {
                validator,
                queues,
                last_occurred_at: DateTime::<Utc>::MIN_UTC,
                next_sequence: 0,
            }),
            sink,
            strategy: config.strategy,
            size_limit: config.size_limit,
            flush_failure_limit: config.flush_failure_limit,
            flush_mutex: Mutex::new(()),
            buffered: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            flush_failure_handler: RwLock::new(None),
            hasher,
            trip,
        }
    }

    pub fn set_flush_failure_handler(&self, handler: FlushFailureHandler) {
        *self.flush_failure_handler.write() = Some(handler);
    }

    /// Validate and enqueue a change. Cascaded removes are enqueued in their
    /// own categories ahead of the primary, all stamped within one critical
    /// section so `occurred_at` is monotonically non-decreasing across the
    /// writer. Returns the primary event's id.
    pub fn buffer(&self, action: EventAction, data: EventData) -> Result<Uuid> {
        self.trip.guard()?;

        let (primary_id, enqueued) = {
            let mut state = self.state.lock();
            let prepends = state.validator.validate(action, &data)?;
            let count = prepends.len() + 1;
            for prepend in prepends {
                state.enqueue(EventAction::Remove, prepend, self.hasher.as_ref());
            }
            let id = state.enqueue(action, data, self.hasher.as_ref());
            (id, count)
        };
        let total = self.buffered.fetch_add(enqueued, Ordering::SeqCst) + enqueued;

        if matches!(
            self.strategy,
            FlushStrategyKind::SizeLimited | FlushStrategyKind::Hybrid
        ) && total >= self.size_limit
        {
            if let Err(e) = self.flush() {
                // buffering itself succeeded; the failure is reported
                // through the registered handler and retried on the next
                // trigger
                tracing::warn!("size-triggered flush failed: {}", e);
                if let Some(handler) = self.flush_failure_handler.read().as_ref() {
                    handler(&e);
                }
            }
        }
        Ok(primary_id)
    }

    /// Validate a pre-formed event against the shadow store and fold it in
    /// without stamping or enqueueing. Range copies and router release go
    /// through this; the caller persists the event itself, preserving its
    /// id and timestamp.
    pub fn absorb_external(&self, event: &Event) -> Result<()> {
        let mut state = self.state.lock();
        let prepends = state.validator.validate(event.action, &event.data)?;
        if !prepends.is_empty() {
            // a copied stream normally carries its own cascades; the shadow
            // was brought in line regardless
            tracing::debug!(
                "ingested remove '{}' synthesized {} cascade entries locally",
                event.id,
                prepends.len()
            );
        }
        if event.occurred_at > state.last_occurred_at {
            state.last_occurred_at = event.occurred_at;
        }
        Ok(())
    }

    /// Number of events buffered and not yet successfully flushed.
    pub fn buffered_count(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    /// Consecutive failed flushes since the last success.
    pub fn consecutive_flush_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Swap out every queue, merge to a single sequence ordered by
    /// `(occurred_at, category priority, insertion sequence)`, and hand the
    /// batch to the sink. On sink failure the batch is pushed back intact.
    pub fn flush(&self) -> Result<usize> {
        let _flush_guard = self.flush_mutex.lock();

        let mut batch: Vec<BufferedEvent> = {
            let mut state = self.state.lock();
            let mut drained = Vec::new();
            for queue in state.queues.values_mut() {
                drained.extend(queue.drain(..));
            }
            drained
        };
        if batch.is_empty() {
            return Ok(0);
        }
        batch.sort_by(|a, b| {
            (a.event.occurred_at, a.event.kind().flush_priority(), a.sequence).cmp(&(
                b.event.occurred_at,
                b.event.kind().flush_priority(),
                b.sequence,
            ))
        });

        let events: Vec<Event> = batch.iter().map(|buffered| buffered.event.clone()).collect();
        match self.sink.accept(&events) {
            Ok(()) => {
                self.buffered.fetch_sub(batch.len(), Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                tracing::debug!("flushed {} events", batch.len());
                Ok(batch.len())
            }
            Err(e) => {
                // retain the batch, ahead of anything enqueued since the swap
                {
                    let mut state = self.state.lock();
                    for buffered in batch.into_iter().rev() {
                        let kind = buffered.event.kind();
                        state
                            .queues
                            .get_mut(&kind)
                            .expect("queue exists for every kind")
                            .push_front(buffered);
                    }
                }
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::error!("buffer flush failed ({} consecutive): {}", failures, e);
                if failures >= self.flush_failure_limit {
                    self.trip
                        .trip(format!("event buffer flush failed persistently: {}", e));
                }
                Err(AccessError::BufferFlushing(e.to_string()))
            }
        }
    }
}

/// Background timer driving `Looping` and `Hybrid` flush strategies. `stop`
/// completes a final flush before the worker exits.
pub struct FlushWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl FlushWorker {
    pub fn start(buffer: Arc<TemporalEventBuffer>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.flush() {
                            tracing::error!("periodic flush failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            // pending events are flushed before the worker exits
            if let Err(e) = buffer.flush() {
                tracing::error!("final flush on shutdown failed: {}", e);
            }
        });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
