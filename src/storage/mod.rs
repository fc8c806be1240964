// # Temporal Event Storage
//
// The persistence seam of the pipeline. A storage backend appends validated
// event batches transactionally and serves ordered reads for reader
// rehydration and shard-range copies. Every record carries the temporal
// columns `(transaction_from, transaction_to)`: a fact is current while
// `transaction_to` is the maximum timestamp, and an invalidating remove
// closes it at one tick before its own transaction time, enabling
// point-in-time reconstruction.
//
// Batches share a transaction time; `transaction_sequence` assigns the
// total order within it.

pub mod backup;
pub mod file_log;
pub mod memory;
pub mod reader;

pub use backup::RedundantEventPersister;
pub use file_log::FileEventLog;
pub use memory::MemoryEventStorage;
pub use reader::{LoadResult, PersistentReader};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::{AccessError, Result};
use crate::event::{tick, Event, EventAction};

/// `transaction_to` value of a currently valid fact.
pub fn max_transaction_to() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

/// How far to replay when rehydrating a store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LoadBoundary {
    Latest,
    UpToEventId(Uuid),
    UpToTimestamp(DateTime<Utc>),
}

/// One persisted event with its temporal columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalEventRecord {
    pub event: Event,
    pub transaction_time: DateTime<Utc>,
    pub transaction_sequence: u32,
    #[serde(with = "crate::event::ticks")]
    pub transaction_from: DateTime<Utc>,
    #[serde(with = "crate::event::ticks")]
    pub transaction_to: DateTime<Utc>,
}

/// Bulk persister interface. Implementations must make `persist_events`
/// all-or-nothing and keep records in persistence order.
pub trait EventStorage: Send + Sync {
    /// Append a batch within one storage transaction. With
    /// `ignore_duplicates`, events whose id is already persisted are
    /// filtered out, making re-flushing an already-persisted batch
    /// idempotent; without it, a duplicate id fails the whole batch.
    fn persist_events(&self, events: &[Event], ignore_duplicates: bool) -> Result<()>;

    /// Every record in persistence order.
    fn read_all(&self) -> Result<Vec<TemporalEventRecord>>;

    /// Events up to the boundary, in persistence order.
    fn read_events_up_to(&self, boundary: &LoadBoundary) -> Result<Vec<Event>>;

    /// Events whose hash code lies in `[range_start, range_end]`, in
    /// persistence order, starting after the cursor event id (when given),
    /// capped at `limit`.
    fn read_range(
        &self,
        range_start: i32,
        range_end: i32,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Delete every record whose hash code lies in the range. Returns the
    /// number of records removed.
    fn delete_range(&self, range_start: i32, range_end: i32) -> Result<usize>;

    fn event_count(&self) -> Result<usize>;
}

/// Staged effect of one batch against the current record set: the records
/// to append plus the facts the batch's removes invalidate. Staging is
/// separate from commit so file-backed storage can write before mutating
/// its in-memory mirror.
#[derive(Debug)]
pub(crate) struct BatchOutcome {
    pub appended: Vec<TemporalEventRecord>,
    /// `(event id of the invalidated add record, new transaction_to)`
    pub invalidated: Vec<(Uuid, DateTime<Utc>)>,
}

pub(crate) fn prepare_batch(
    records: &[TemporalEventRecord],
    ids: &HashSet<Uuid>,
    events: &[Event],
    ignore_duplicates: bool,
) -> Result<BatchOutcome> {
    let transaction_time = Utc::now();
    let mut outcome = BatchOutcome {
        appended: Vec::new(),
        invalidated: Vec::new(),
    };
    let mut sequence: u32 = 0;
    for event in events {
        if ids.contains(&event.id)
            || outcome
                .appended
                .iter()
                .any(|record| record.event.id == event.id)
        {
            if ignore_duplicates {
                continue;
            }
            return Err(AccessError::Storage(format!(
                "event '{}' is already persisted",
                event.id
            )));
        }
        if event.action == EventAction::Remove {
            let closed_at = transaction_time - tick();
            // the remove closes the currently valid add of the same fact
            let target = outcome
                .appended
                .iter()
                .rev()
                .chain(records.iter().rev())
                .find(|record| {
                    record.event.action == EventAction::Add
                        && record.event.data == event.data
                        && record.transaction_to == max_transaction_to()
                        && !outcome
                            .invalidated
                            .iter()
                            .any(|(id, _)| *id == record.event.id)
                })
                .map(|record| record.event.id);
            if let Some(id) = target {
                outcome.invalidated.push((id, closed_at));
            }
        }
        outcome.appended.push(TemporalEventRecord {
            event: event.clone(),
            transaction_time,
            transaction_sequence: sequence,
            transaction_from: transaction_time,
            transaction_to: max_transaction_to(),
        });
        sequence += 1;
    }
    Ok(outcome)
}

pub(crate) fn commit_batch(
    records: &mut Vec<TemporalEventRecord>,
    ids: &mut HashSet<Uuid>,
    outcome: BatchOutcome,
) {
    for (id, closed_at) in outcome.invalidated {
        if let Some(record) = records.iter_mut().find(|record| record.event.id == id) {
            record.transaction_to = closed_at;
        }
    }
    for record in outcome.appended {
        ids.insert(record.event.id);
        records.push(record);
    }
}

pub(crate) fn events_up_to(
    records: &[TemporalEventRecord],
    boundary: &LoadBoundary,
) -> Result<Vec<Event>> {
    match boundary {
        LoadBoundary::Latest => Ok(records.iter().map(|record| record.event.clone()).collect()),
        LoadBoundary::UpToEventId(id) => {
            let mut events = Vec::new();
            let mut found = false;
            for record in records {
                events.push(record.event.clone());
                if record.event.id == *id {
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(AccessError::NotFound(format!(
                    "event '{}' is not persisted",
                    id
                )));
            }
            Ok(events)
        }
        LoadBoundary::UpToTimestamp(ts) => Ok(records
            .iter()
            .take_while(|record| record.event.occurred_at <= *ts)
            .map(|record| record.event.clone())
            .collect()),
    }
}

pub(crate) fn events_in_range(
    records: &[TemporalEventRecord],
    range_start: i32,
    range_end: i32,
    after: Option<Uuid>,
    limit: usize,
) -> Vec<Event> {
    let mut past_cursor = after.is_none();
    let mut events = Vec::new();
    for record in records {
        let hash = record.event.hash_code;
        if hash < range_start || hash > range_end {
            continue;
        }
        if !past_cursor {
            if Some(record.event.id) == after {
                past_cursor = true;
            }
            continue;
        }
        events.push(record.event.clone());
        if events.len() >= limit {
            break;
        }
    }
    events
}
