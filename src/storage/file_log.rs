// File-backed event log
//
// An append-only JSON-lines file mirrored in memory. Appends write `record`
// lines; temporal invalidation never rewrites a line in place, it appends
// an `invalidate` line that is folded into the in-memory index when the
// log is opened. A torn trailing line (crash mid-write) is dropped at open;
// re-flushing the interrupted batch with `ignore_duplicates` makes the
// recovery idempotent.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{
    commit_batch, events_in_range, events_up_to, prepare_batch, EventStorage, LoadBoundary,
    TemporalEventRecord,
};
use crate::error::Result;
use crate::event::Event;

#[derive(Debug, Serialize, Deserialize)]
enum LogLine {
    Record(TemporalEventRecord),
    Invalidate {
        id: Uuid,
        #[serde(with = "crate::event::ticks")]
        at: DateTime<Utc>,
    },
    Delete {
        range_start: i32,
        range_end: i32,
    },
}

struct FileLogInner {
    records: Vec<TemporalEventRecord>,
    ids: HashSet<Uuid>,
}

pub struct FileEventLog {
    path: PathBuf,
    inner: Mutex<FileLogInner>,
}

impl FileEventLog {
    /// Open (or create) the log at `path` and fold its lines into the
    /// in-memory mirror.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut records: Vec<TemporalEventRecord> = Vec::new();
        let mut ids: HashSet<Uuid> = HashSet::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: LogLine = match serde_json::from_str(&line) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        // torn tail from an interrupted write; everything
                        // before it is intact
                        tracing::warn!(
                            "dropping unparsable log line {} in '{}': {}",
                            line_number + 1,
                            path.display(),
                            e
                        );
                        break;
                    }
                };
                match parsed {
                    LogLine::Record(record) => {
                        ids.insert(record.event.id);
                        records.push(record);
                    }
                    LogLine::Invalidate { id, at } => {
                        if let Some(record) =
                            records.iter_mut().find(|record| record.event.id == id)
                        {
                            record.transaction_to = at;
                        }
                    }
                    LogLine::Delete {
                        range_start,
                        range_end,
                    } => {
                        records.retain(|record| {
                            record.event.hash_code < range_start
                                || record.event.hash_code > range_end
                        });
                        ids = records.iter().map(|record| record.event.id).collect();
                    }
                }
            }
        }
        Ok(Self {
            path,
            inner: Mutex::new(FileLogInner { records, ids }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_lines(&self, lines: &[LogLine]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut payload = String::new();
        for line in lines {
            payload.push_str(&serde_json::to_string(line)?);
            payload.push('\n');
        }
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl EventStorage for FileEventLog {
    fn persist_events(&self, events: &[Event], ignore_duplicates: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let outcome = prepare_batch(&inner.records, &inner.ids, events, ignore_duplicates)?;

        let mut lines: Vec<LogLine> = Vec::with_capacity(outcome.appended.len());
        for (id, at) in &outcome.invalidated {
            lines.push(LogLine::Invalidate { id: *id, at: *at });
        }
        for record in &outcome.appended {
            lines.push(LogLine::Record(record.clone()));
        }
        // write first; the mirror is only updated once the lines are on disk
        self.append_lines(&lines)?;

        let FileLogInner { records, ids } = &mut *inner;
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
        self.append_lines(&[LogLine::Delete {
            range_start,
            range_end,
        }])?;
        inner.records.retain(|record| {
            record.event.hash_code < range_start || record.event.hash_code > range_end
        });
        inner.ids = inner.records.iter().map(|record| record.event.id).collect();
        Ok(before - inner.records.len())
    }

    fn event_count(&self) -> Result<usize> {
        Ok(self.inner.lock().records.len())
    }
}

impl std::fmt::Debug for FileEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Fnv1aKeyHasher;
    use crate::event::{EventAction, EventData};
    use crate::model::User;
    use crate::storage::max_transaction_to;

    fn user_event(action: EventAction, name: &str) -> Event {
        Event::new(
            action,
            EventData::User { user: User::new(name) },
            Utc::now(),
            &Fnv1aKeyHasher,
        )
    }

    #[test]
    fn test_reopen_recovers_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let events = vec![
            user_event(EventAction::Add, "u1"),
            user_event(EventAction::Add, "u2"),
        ];
        {
            let log = FileEventLog::open(&path).unwrap();
            log.persist_events(&events, false).unwrap();
        }
        let reopened = FileEventLog::open(&path).unwrap();
        let records = reopened.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.id, events[0].id);
    }

    #[test]
    fn test_invalidation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let add = user_event(EventAction::Add, "u1");
        let remove = user_event(EventAction::Remove, "u1");
        {
            let log = FileEventLog::open(&path).unwrap();
            log.persist_events(&[add.clone()], false).unwrap();
            log.persist_events(&[remove], false).unwrap();
        }
        let reopened = FileEventLog::open(&path).unwrap();
        let records = reopened.read_all().unwrap();
        assert_eq!(records.len(), 2);
        let add_record = records.iter().find(|r| r.event.id == add.id).unwrap();
        assert!(add_record.transaction_to < max_transaction_to());
    }

    #[test]
    fn test_torn_tail_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        {
            let log = FileEventLog::open(&path).unwrap();
            log.persist_events(&[user_event(EventAction::Add, "u1")], false)
                .unwrap();
        }
        // simulate a crash mid-append
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"Record\":{\"event\":").unwrap();
        drop(file);

        let reopened = FileEventLog::open(&path).unwrap();
        assert_eq!(reopened.event_count().unwrap(), 1);
    }

    #[test]
    fn test_delete_range_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let events: Vec<Event> = (0..20)
            .map(|i| user_event(EventAction::Add, &format!("u{}", i)))
            .collect();
        let kept = events.iter().filter(|e| e.hash_code >= 0).count();
        {
            let log = FileEventLog::open(&path).unwrap();
            log.persist_events(&events, false).unwrap();
            log.delete_range(i32::MIN, -1).unwrap();
        }
        let reopened = FileEventLog::open(&path).unwrap();
        assert_eq!(reopened.event_count().unwrap(), kept);
        assert!(reopened
            .read_all()
            .unwrap()
            .iter()
            .all(|r| r.event.hash_code >= 0));
    }
}
