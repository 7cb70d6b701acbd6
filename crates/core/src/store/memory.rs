use super::{EventStore, StoreError};
use crate::event::Event;
use crate::types::RunId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// In-memory event store for tests and bus-less deployments. Same contract
/// as the durable backend; no durability, no pruning.
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<BTreeMap<(String, u64), Event>>,
    closed: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: Event) -> Result<(), StoreError> {
        self.check_open()?;

        let key = (event.run_id.to_string(), event.seq);
        let mut events = self.events.write().unwrap();
        if events.contains_key(&key) {
            return Err(StoreError::DuplicateSeq {
                run_id: event.run_id.clone(),
                seq: event.seq,
            });
        }
        events.insert(key, event);
        Ok(())
    }

    async fn list(
        &self,
        run_id: &RunId,
        after_seq: u64,
        limit: i64,
    ) -> Result<Vec<Event>, StoreError> {
        self.check_open()?;

        let start = after_seq.saturating_add(1);
        let events = self.events.read().unwrap();
        let range = events
            .range((run_id.to_string(), start)..=(run_id.to_string(), u64::MAX))
            .map(|(_, event)| event.clone());

        Ok(if limit > 0 {
            range.take(limit as usize).collect()
        } else {
            range.collect()
        })
    }

    async fn latest_seq(&self, run_id: &RunId) -> Result<u64, StoreError> {
        self.check_open()?;

        let events = self.events.read().unwrap();
        Ok(events
            .range((run_id.to_string(), 0)..=(run_id.to_string(), u64::MAX))
            .next_back()
            .map(|((_, seq), _)| *seq)
            .unwrap_or(0))
    }

    async fn run_ids(&self) -> Result<Vec<RunId>, StoreError> {
        self.check_open()?;

        let events = self.events.read().unwrap();
        let mut ids: Vec<RunId> = Vec::new();
        for (run_id, _) in events.keys() {
            if ids.last().map(|last| last.as_str()) != Some(run_id.as_str()) {
                ids.push(RunId::from(run_id.clone()));
            }
        }
        Ok(ids)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
