use crate::event::Event;
use crate::types::RunId;
use std::time::Duration;

mod memory;
mod redb_store;

pub use memory::MemoryEventStore;
pub use redb_store::RedbEventStore;

/// Errors surfaced by an event store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate event seq {seq} for run {run_id}")]
    DuplicateSeq { run_id: RunId, seq: u64 },

    #[error("event store is closed")]
    Closed,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Retention settings for the durable store. Pruning runs in the background
/// at `prune_interval` whenever age- or count-based retention is set.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Delete events older than this
    pub retention_age: Option<Duration>,
    /// Keep at most this many events (highest seq) per run
    pub retention_count: Option<u64>,
    pub prune_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_age: None,
            retention_count: None,
            prune_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RetentionConfig {
    pub fn is_enabled(&self) -> bool {
        self.retention_age.is_some() || self.retention_count.is_some()
    }
}

/// Durable append-only log of run events keyed by `(run_id, seq)`.
///
/// Appends are never deduplicated: a `(run_id, seq)` collision is an error.
/// Reads observe the durable prefix in ascending `seq` order.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event. Fails with [`StoreError::DuplicateSeq`] on a
    /// `(run_id, seq)` collision.
    async fn append(&self, event: Event) -> Result<(), StoreError>;

    /// Events with `seq > after_seq`, ascending. `limit <= 0` means
    /// unbounded.
    async fn list(&self, run_id: &RunId, after_seq: u64, limit: i64)
        -> Result<Vec<Event>, StoreError>;

    /// Highest seq for the run, or 0 when the run has no events.
    async fn latest_seq(&self, run_id: &RunId) -> Result<u64, StoreError>;

    /// Sorted distinct run IDs present in the store.
    async fn run_ids(&self) -> Result<Vec<RunId>, StoreError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::{json, Map};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn event(run: &str, seq: u64) -> Event {
        let mut payload = Map::new();
        payload.insert("seq".to_string(), json!(seq));
        Event::run_level(
            RunId::from(run.to_string()),
            seq,
            EventKind::NodeStarted,
            payload,
        )
    }

    fn memory_store() -> Arc<dyn EventStore> {
        Arc::new(MemoryEventStore::new())
    }

    fn redb_store(dir: &TempDir) -> Arc<dyn EventStore> {
        Arc::new(
            RedbEventStore::open(dir.path().join("events.redb"), RetentionConfig::default())
                .unwrap(),
        )
    }

    async fn check_cursor_replay(store: Arc<dyn EventStore>) {
        let run = RunId::from("run-1".to_string());
        for seq in 1..=10 {
            store.append(event("run-1", seq)).await.unwrap();
        }

        let tail = store.list(&run, 7, 0).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![8, 9, 10]);

        let window = store.list(&run, 5, 2).await.unwrap();
        assert_eq!(window.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![6, 7]);

        let all = store.list(&run, 0, 0).await.unwrap();
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    async fn check_duplicate_seq_rejected(store: Arc<dyn EventStore>) {
        store.append(event("run-1", 1)).await.unwrap();
        let err = store.append(event("run-1", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSeq { seq: 1, .. }));

        // Same seq on another run is fine.
        store.append(event("run-2", 1)).await.unwrap();
    }

    async fn check_latest_seq(store: Arc<dyn EventStore>) {
        let run = RunId::from("run-1".to_string());
        assert_eq!(store.latest_seq(&run).await.unwrap(), 0);

        for seq in 1..=4 {
            store.append(event("run-1", seq)).await.unwrap();
        }
        assert_eq!(store.latest_seq(&run).await.unwrap(), 4);
    }

    async fn check_run_ids_sorted(store: Arc<dyn EventStore>) {
        for run in ["run-c", "run-a", "run-b"] {
            store.append(event(run, 1)).await.unwrap();
            store.append(event(run, 2)).await.unwrap();
        }

        let ids: Vec<String> = store
            .run_ids()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.to_string())
            .collect();
        assert_eq!(ids, vec!["run-a", "run-b", "run-c"]);
    }

    async fn check_payload_round_trip(store: Arc<dyn EventStore>) {
        let run = RunId::from("run-1".to_string());
        let mut payload = Map::new();
        payload.insert(
            "nested".to_string(),
            json!({"list": [1, 2.5, true, null], "flag": false}),
        );

        let mut e = event("run-1", 1);
        e.payload = payload.clone();
        store.append(e).await.unwrap();

        let got = store.list(&run, 0, 0).await.unwrap();
        assert_eq!(got[0].payload, payload);
    }

    #[tokio::test]
    async fn test_memory_cursor_replay() {
        check_cursor_replay(memory_store()).await;
    }

    #[tokio::test]
    async fn test_redb_cursor_replay() {
        let dir = TempDir::new().unwrap();
        check_cursor_replay(redb_store(&dir)).await;
    }

    #[tokio::test]
    async fn test_memory_duplicate_seq() {
        check_duplicate_seq_rejected(memory_store()).await;
    }

    #[tokio::test]
    async fn test_redb_duplicate_seq() {
        let dir = TempDir::new().unwrap();
        check_duplicate_seq_rejected(redb_store(&dir)).await;
    }

    #[tokio::test]
    async fn test_memory_latest_seq() {
        check_latest_seq(memory_store()).await;
    }

    #[tokio::test]
    async fn test_redb_latest_seq() {
        let dir = TempDir::new().unwrap();
        check_latest_seq(redb_store(&dir)).await;
    }

    #[tokio::test]
    async fn test_memory_run_ids_sorted() {
        check_run_ids_sorted(memory_store()).await;
    }

    #[tokio::test]
    async fn test_redb_run_ids_sorted() {
        let dir = TempDir::new().unwrap();
        check_run_ids_sorted(redb_store(&dir)).await;
    }

    #[tokio::test]
    async fn test_memory_payload_round_trip() {
        check_payload_round_trip(memory_store()).await;
    }

    #[tokio::test]
    async fn test_redb_payload_round_trip() {
        let dir = TempDir::new().unwrap();
        check_payload_round_trip(redb_store(&dir)).await;
    }

    #[tokio::test]
    async fn test_redb_retention_by_count() {
        let dir = TempDir::new().unwrap();
        let store = RedbEventStore::open(
            dir.path().join("events.redb"),
            RetentionConfig {
                retention_count: Some(3),
                ..Default::default()
            },
        )
        .unwrap();

        for seq in 1..=7 {
            store.append(event("run-1", seq)).await.unwrap();
        }
        store.prune_now().unwrap();

        let run = RunId::from("run-1".to_string());
        let kept = store.list(&run, 0, 0).await.unwrap();
        assert_eq!(kept.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![5, 6, 7]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_redb_retention_by_age() {
        let dir = TempDir::new().unwrap();
        let store = RedbEventStore::open(
            dir.path().join("events.redb"),
            RetentionConfig {
                retention_age: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        )
        .unwrap();

        let mut old = event("run-1", 1);
        old.time = Utc::now() - ChronoDuration::seconds(120);
        store.append(old).await.unwrap();
        store.append(event("run-1", 2)).await.unwrap();

        store.prune_now().unwrap();

        let run = RunId::from("run-1".to_string());
        let kept = store.list(&run, 0, 0).await.unwrap();
        assert_eq!(kept.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2]);
        store.close().await;
    }

    #[tokio::test]
    async fn test_redb_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.redb");

        {
            let store = RedbEventStore::open(&path, RetentionConfig::default()).unwrap();
            store.append(event("run-1", 1)).await.unwrap();
            store.close().await;
        }

        let store = RedbEventStore::open(&path, RetentionConfig::default()).unwrap();
        let run = RunId::from("run-1".to_string());
        assert_eq!(store.latest_seq(&run).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let store = memory_store();
        store.close().await;
        let err = store.append(event("run-1", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }
}
