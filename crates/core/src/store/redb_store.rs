use super::{EventStore, RetentionConfig, StoreError};
use crate::event::Event;
use crate::types::RunId;
use anyhow::Context;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Events keyed by `(run_id, seq)`; the composite key makes the uniqueness
/// invariant a property of the table itself and keeps per-run ranges
/// contiguous for cursor reads.
const EVENTS_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("events");

/// Durable event store backed by redb. Readers run against MVCC snapshots, so
/// `list` and `append` proceed concurrently.
pub struct RedbEventStore {
    db: Arc<Database>,
    retention: RetentionConfig,
    closed: AtomicBool,
    stop: CancellationToken,
    pruner: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RedbEventStore {
    /// Open (or create) the store at `path`. Spawns the background pruner
    /// when retention is configured, so this must be called from within a
    /// tokio runtime.
    pub fn open(path: impl AsRef<Path>, retention: RetentionConfig) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create event store directory")?;
        }

        let db = Database::create(path).context("failed to open event database")?;
        let db = Arc::new(db);

        // Initialize the table up front so readers never race table creation.
        let write_txn = db.begin_write().context("failed to begin write")?;
        {
            let _table = write_txn
                .open_table(EVENTS_TABLE)
                .context("failed to open events table")?;
        }
        write_txn.commit().context("failed to commit")?;

        let store = Self {
            db,
            retention,
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
            pruner: tokio::sync::Mutex::new(None),
        };
        store.spawn_pruner();
        Ok(store)
    }

    fn spawn_pruner(&self) {
        if !self.retention.is_enabled() {
            return;
        }

        let db = self.db.clone();
        let retention = self.retention.clone();
        let stop = self.stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention.prune_interval);
            // The immediate first tick is a no-op: nothing to prune yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = prune(&db, &retention) {
                            tracing::warn!("event retention prune failed: {}", e);
                        }
                    }
                }
            }
        });

        // open() runs before any other access, so the slot is free.
        if let Ok(mut slot) = self.pruner.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Run one retention pass immediately.
    pub fn prune_now(&self) -> Result<(), StoreError> {
        prune(&self.db, &self.retention)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventStore for RedbEventStore {
    async fn append(&self, event: Event) -> Result<(), StoreError> {
        self.check_open()?;

        let key = (event.run_id.as_str(), event.seq);
        let value = serde_json::to_vec(&event).context("failed to serialize event")?;

        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(EVENTS_TABLE)
                .context("failed to open events table")?;

            let existing = table.get(key).context("failed to probe for duplicate")?;
            if existing.is_some() {
                return Err(StoreError::DuplicateSeq {
                    run_id: event.run_id.clone(),
                    seq: event.seq,
                });
            }
            drop(existing);

            table
                .insert(key, value.as_slice())
                .context("failed to insert event")?;
        }
        write_txn.commit().context("failed to commit event")?;

        Ok(())
    }

    async fn list(
        &self,
        run_id: &RunId,
        after_seq: u64,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        self.check_open()?;

        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(EVENTS_TABLE)
            .context("failed to open events table")?;

        let start = after_seq.saturating_add(1);
        let range = table
            .range((run_id.as_str(), start)..=(run_id.as_str(), u64::MAX))
            .context("failed to range events")?;

        let mut events = Vec::new();
        for item in range {
            if limit > 0 && events.len() as i64 >= limit {
                break;
            }
            let (_key, value) = item.context("failed to read event")?;
            let event: Event =
                serde_json::from_slice(value.value()).context("failed to deserialize event")?;
            events.push(event);
        }

        Ok(events)
    }

    async fn latest_seq(&self, run_id: &RunId) -> Result<u64, StoreError> {
        self.check_open()?;

        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(EVENTS_TABLE)
            .context("failed to open events table")?;

        let mut range = table
            .range((run_id.as_str(), 0)..=(run_id.as_str(), u64::MAX))
            .context("failed to range events")?;

        match range.next_back() {
            Some(item) => {
                let (key, _value) = item.context("failed to read event")?;
                Ok(key.value().1)
            }
            None => Ok(0),
        }
    }

    async fn run_ids(&self) -> Result<Vec<RunId>, StoreError> {
        self.check_open()?;

        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(EVENTS_TABLE)
            .context("failed to open events table")?;

        // Keys are ordered, so distinct run IDs come out already sorted.
        let mut ids: Vec<RunId> = Vec::new();
        for item in table.iter().context("failed to iterate events")? {
            let (key, _value) = item.context("failed to read event")?;
            let run_id = key.value().0;
            if ids.last().map(|last| last.as_str()) != Some(run_id) {
                ids.push(RunId::from(run_id.to_string()));
            }
        }

        Ok(ids)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.cancel();
        let handle = self.pruner.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// One retention pass: a single scan for age pruning plus one write
/// transaction per run for count pruning.
fn prune(db: &Database, retention: &RetentionConfig) -> Result<(), StoreError> {
    if let Some(age) = retention.retention_age {
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());

        let write_txn = db.begin_write().context("failed to begin prune write")?;
        {
            let mut table = write_txn
                .open_table(EVENTS_TABLE)
                .context("failed to open events table")?;

            let mut expired: Vec<(String, u64)> = Vec::new();
            for item in table.iter().context("failed to iterate events")? {
                let (key, value) = item.context("failed to read event")?;
                let event: Event = serde_json::from_slice(value.value())
                    .context("failed to deserialize event")?;
                if event.time < cutoff {
                    let (run_id, seq) = key.value();
                    expired.push((run_id.to_string(), seq));
                }
            }

            for (run_id, seq) in &expired {
                table
                    .remove((run_id.as_str(), *seq))
                    .context("failed to remove expired event")?;
            }

            if !expired.is_empty() {
                tracing::debug!(count = expired.len(), "pruned events past retention age");
            }
        }
        write_txn.commit().context("failed to commit age prune")?;
    }

    if let Some(count) = retention.retention_count {
        // Snapshot the per-run tail boundaries first, then trim run by run.
        let mut boundaries: Vec<(String, u64)> = Vec::new();
        {
            let read_txn = db.begin_read().context("failed to begin prune read")?;
            let table = read_txn
                .open_table(EVENTS_TABLE)
                .context("failed to open events table")?;

            let mut current: Option<(String, u64)> = None;
            for item in table.iter().context("failed to iterate events")? {
                let (key, _value) = item.context("failed to read event")?;
                let (run_id, seq) = key.value();
                match &mut current {
                    Some((id, max)) if id == run_id => *max = seq,
                    _ => {
                        if let Some(done) = current.take() {
                            boundaries.push(done);
                        }
                        current = Some((run_id.to_string(), seq));
                    }
                }
            }
            if let Some(done) = current.take() {
                boundaries.push(done);
            }
        }

        for (run_id, latest) in boundaries {
            if latest <= count {
                continue;
            }
            let min_keep = latest - count + 1;

            let write_txn = db.begin_write().context("failed to begin prune write")?;
            {
                let mut table = write_txn
                    .open_table(EVENTS_TABLE)
                    .context("failed to open events table")?;

                let mut stale: Vec<u64> = Vec::new();
                for item in table
                    .range((run_id.as_str(), 0)..(run_id.as_str(), min_keep))
                    .context("failed to range stale events")?
                {
                    let (key, _value) = item.context("failed to read event")?;
                    stale.push(key.value().1);
                }
                for seq in stale {
                    table
                        .remove((run_id.as_str(), seq))
                        .context("failed to remove stale event")?;
                }
            }
            write_txn.commit().context("failed to commit count prune")?;
        }
    }

    Ok(())
}
