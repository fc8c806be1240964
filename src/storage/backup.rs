// Redundant backup persister
//
// Wraps a primary storage backend with a file-based append-only secondary.
// When the primary fails a batch, the batch lands in the backup log and the
// flush is considered delivered. Once the primary accepts writes again, the
// queued backup events are drained into it in order (read, write, delete)
// before any new batch is persisted. A backup write failure on top of a
// primary failure trips the switch.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::{EventStorage, LoadBoundary, TemporalEventRecord};
use crate::common::TripSwitch;
use crate::error::{AccessError, Result};
use crate::event::Event;

/// Append-only file of events awaiting redelivery to the primary.
struct BackupEventLog {
    path: PathBuf,
}

impl BackupEventLog {
    fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    fn append(&self, events: &[Event]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut payload = String::new();
        for event in events {
            payload.push_str(&serde_json::to_string(event)?);
            payload.push('\n');
        }
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        self.path.exists()
    }
}

pub struct RedundantEventPersister {
    primary: Arc<dyn EventStorage>,
    backup: BackupEventLog,
    /// serializes persist/drain so redelivery order is preserved
    write_lock: Mutex<()>,
    trip: Arc<TripSwitch>,
}

impl RedundantEventPersister {
    pub fn new<P: AsRef<Path>>(
        primary: Arc<dyn EventStorage>,
        backup_path: P,
        trip: Arc<TripSwitch>,
    ) -> Result<Self> {
        Ok(Self {
            primary,
            backup: BackupEventLog::new(backup_path.as_ref().to_path_buf())?,
            write_lock: Mutex::new(()),
            trip,
        })
    }

    pub fn pending_backup_count(&self) -> Result<usize> {
        Ok(self.backup.read_all()?.len())
    }

    /// Redeliver queued backup events into the primary, oldest first.
    fn drain_backup(&self) -> Result<()> {
        let pending = self.backup.read_all()?;
        if pending.is_empty() {
            self.backup.clear()?;
            return Ok(());
        }
        // redelivery may race a batch that partially reached the primary
        // before the failure, so duplicates are filtered
        self.primary.persist_events(&pending, true)?;
        self.backup.clear()?;
        tracing::info!(
            "drained {} backup events into recovered primary storage",
            pending.len()
        );
        Ok(())
    }
}

impl EventStorage for RedundantEventPersister {
    fn persist_events(&self, events: &[Event], ignore_duplicates: bool) -> Result<()> {
        let _guard = self.write_lock.lock();

        if self.backup.has_pending() {
            if let Err(e) = self.drain_backup() {
                // primary still down; the new batch queues behind the
                // pending ones
                tracing::warn!("primary storage still unavailable: {}", e);
                return match self.backup.append(events) {
                    Ok(()) => Ok(()),
                    Err(backup_err) => {
                        self.trip.trip(format!(
                            "primary and backup storage both failed: {}",
                            backup_err
                        ));
                        Err(backup_err)
                    }
                };
            }
        }

        match self.primary.persist_events(events, ignore_duplicates) {
            Ok(()) => Ok(()),
            Err(primary_err) => {
                tracing::warn!(
                    "primary storage rejected batch of {}; writing to backup: {}",
                    events.len(),
                    primary_err
                );
                match self.backup.append(events) {
                    Ok(()) => Ok(()),
                    Err(backup_err) => {
                        self.trip.trip(format!(
                            "primary and backup storage both failed: {} / {}",
                            primary_err, backup_err
                        ));
                        Err(AccessError::Storage(format!(
                            "primary and backup storage both failed: {}",
                            backup_err
                        )))
                    }
                }
            }
        }
    }

    fn read_all(&self) -> Result<Vec<TemporalEventRecord>> {
        self.primary.read_all()
    }

    fn read_events_up_to(&self, boundary: &LoadBoundary) -> Result<Vec<Event>> {
        self.primary.read_events_up_to(boundary)
    }

    fn read_range(
        &self,
        range_start: i32,
        range_end: i32,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        self.primary.read_range(range_start, range_end, after, limit)
    }

    fn delete_range(&self, range_start: i32, range_end: i32) -> Result<usize> {
        self.primary.delete_range(range_start, range_end)
    }

    fn event_count(&self) -> Result<usize> {
        self.primary.event_count()
    }
}
