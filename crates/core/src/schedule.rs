use crate::store::StoreError;
use crate::types::{RunId, RunOptions, ScheduleId, WorkflowId};
use anyhow::Context;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const SCHEDULES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("schedules");

/// Outcome of a schedule's most recent firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Running,
    Completed,
    Failed,
    SkippedOverlap,
}

/// A persistent cron binding: expression + input/options for one workflow.
/// While enabled, `next_run_at` always holds the next UTC fire instant
/// computed strictly after the reference time of the last update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    pub id: ScheduleId,
    pub workflow_id: WorkflowId,
    pub cron: String,
    pub enabled: bool,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub options: RunOptions,
    pub next_run_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ScheduleStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSchedule {
    pub fn new(workflow_id: WorkflowId, cron: String, next_run_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduleId::new(),
            workflow_id,
            cron,
            enabled: true,
            input: Map::new(),
            options: RunOptions::default(),
            next_run_at,
            last_run_at: None,
            last_run_id: None,
            last_status: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable per-workflow schedules with a due query for the scheduler loop.
#[async_trait::async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn put(&self, schedule: WorkflowSchedule) -> Result<(), StoreError>;

    async fn get(&self, id: &ScheduleId) -> Result<Option<WorkflowSchedule>, StoreError>;

    async fn list(&self) -> Result<Vec<WorkflowSchedule>, StoreError>;

    async fn delete(&self, id: &ScheduleId) -> Result<bool, StoreError>;

    /// All schedules bound to a workflow are deleted with it.
    async fn delete_by_workflow(&self, workflow_id: &WorkflowId) -> Result<usize, StoreError>;

    /// Enabled schedules with `next_run_at <= now`, ascending by
    /// `next_run_at`, at most `limit`.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowSchedule>, StoreError>;
}

/// Schedule store on a shared redb database.
pub struct RedbScheduleStore {
    db: Arc<Database>,
}

impl RedbScheduleStore {
    pub fn new(db: Arc<Database>) -> Result<Self, StoreError> {
        let write_txn = db.begin_write().context("failed to begin write")?;
        {
            let _table = write_txn
                .open_table(SCHEDULES_TABLE)
                .context("failed to open schedules table")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(Self { db })
    }

    fn scan(&self) -> Result<Vec<WorkflowSchedule>, StoreError> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(SCHEDULES_TABLE)
            .context("failed to open schedules table")?;

        let mut schedules = Vec::new();
        for item in table.iter().context("failed to iterate schedules")? {
            let (_key, value) = item.context("failed to read schedule")?;
            let schedule: WorkflowSchedule =
                serde_json::from_slice(value.value()).context("failed to deserialize schedule")?;
            schedules.push(schedule);
        }
        Ok(schedules)
    }
}

#[async_trait::async_trait]
impl ScheduleStore for RedbScheduleStore {
    async fn put(&self, schedule: WorkflowSchedule) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&schedule).context("failed to serialize schedule")?;

        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(SCHEDULES_TABLE)
                .context("failed to open schedules table")?;
            table
                .insert(schedule.id.as_str(), value.as_slice())
                .context("failed to insert schedule")?;
        }
        write_txn.commit().context("failed to commit schedule")?;
        Ok(())
    }

    async fn get(&self, id: &ScheduleId) -> Result<Option<WorkflowSchedule>, StoreError> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(SCHEDULES_TABLE)
            .context("failed to open schedules table")?;

        match table.get(id.as_str()).context("failed to get schedule")? {
            Some(guard) => {
                let schedule: WorkflowSchedule = serde_json::from_slice(guard.value())
                    .context("failed to deserialize schedule")?;
                Ok(Some(schedule))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowSchedule>, StoreError> {
        self.scan()
    }

    async fn delete(&self, id: &ScheduleId) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        let removed = {
            let mut table = write_txn
                .open_table(SCHEDULES_TABLE)
                .context("failed to open schedules table")?;
            let removed = table
                .remove(id.as_str())
                .context("failed to remove schedule")?
                .is_some();
            removed
        };
        write_txn.commit().context("failed to commit delete")?;
        Ok(removed)
    }

    async fn delete_by_workflow(&self, workflow_id: &WorkflowId) -> Result<usize, StoreError> {
        let doomed: Vec<String> = self
            .scan()?
            .into_iter()
            .filter(|s| s.workflow_id == *workflow_id)
            .map(|s| s.id.0)
            .collect();

        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(SCHEDULES_TABLE)
                .context("failed to open schedules table")?;
            for id in &doomed {
                table
                    .remove(id.as_str())
                    .context("failed to remove schedule")?;
            }
        }
        write_txn.commit().context("failed to commit cascade")?;
        Ok(doomed.len())
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowSchedule>, StoreError> {
        let mut due: Vec<WorkflowSchedule> = self
            .scan()?
            .into_iter()
            .filter(|s| s.enabled && s.next_run_at <= now)
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit);
        Ok(due)
    }
}

/// In-memory schedule store for tests.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<String, WorkflowSchedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn put(&self, schedule: WorkflowSchedule) -> Result<(), StoreError> {
        self.schedules
            .write()
            .unwrap()
            .insert(schedule.id.to_string(), schedule);
        Ok(())
    }

    async fn get(&self, id: &ScheduleId) -> Result<Option<WorkflowSchedule>, StoreError> {
        Ok(self.schedules.read().unwrap().get(id.as_str()).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkflowSchedule>, StoreError> {
        let mut schedules: Vec<WorkflowSchedule> =
            self.schedules.read().unwrap().values().cloned().collect();
        schedules.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(schedules)
    }

    async fn delete(&self, id: &ScheduleId) -> Result<bool, StoreError> {
        Ok(self.schedules.write().unwrap().remove(id.as_str()).is_some())
    }

    async fn delete_by_workflow(&self, workflow_id: &WorkflowId) -> Result<usize, StoreError> {
        let mut schedules = self.schedules.write().unwrap();
        let before = schedules.len();
        schedules.retain(|_, s| s.workflow_id != *workflow_id);
        Ok(before - schedules.len())
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowSchedule>, StoreError> {
        let mut due: Vec<WorkflowSchedule> = self
            .schedules
            .read()
            .unwrap()
            .values()
            .filter(|s| s.enabled && s.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn schedule(workflow: &str, due_in_secs: i64) -> WorkflowSchedule {
        WorkflowSchedule::new(
            WorkflowId::new(workflow),
            "* * * * *".to_string(),
            Utc::now() + ChronoDuration::seconds(due_in_secs),
        )
    }

    async fn check_crud(store: &dyn ScheduleStore) {
        let s = schedule("wf-1", 60);
        let id = s.id.clone();
        store.put(s).await.unwrap();

        let got = store.get(&id).await.unwrap().unwrap();
        assert_eq!(got.workflow_id.as_str(), "wf-1");
        assert!(got.enabled);

        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
    }

    async fn check_list_due(store: &dyn ScheduleStore) {
        let overdue_old = schedule("wf-1", -120);
        let overdue_new = schedule("wf-2", -30);
        let future = schedule("wf-3", 3600);
        let mut disabled = schedule("wf-4", -120);
        disabled.enabled = false;

        for s in [&overdue_old, &overdue_new, &future, &disabled] {
            store.put(s.clone()).await.unwrap();
        }

        let due = store.list_due(Utc::now(), 100).await.unwrap();
        assert_eq!(due.len(), 2);
        // Ascending by next_run_at: most overdue first.
        assert_eq!(due[0].id, overdue_old.id);
        assert_eq!(due[1].id, overdue_new.id);

        let limited = store.list_due(Utc::now(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, overdue_old.id);
    }

    async fn check_cascade(store: &dyn ScheduleStore) {
        store.put(schedule("wf-1", 60)).await.unwrap();
        store.put(schedule("wf-1", 120)).await.unwrap();
        store.put(schedule("wf-2", 60)).await.unwrap();

        let removed = store
            .delete_by_workflow(&WorkflowId::new("wf-1"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_schedule_crud() {
        check_crud(&MemoryScheduleStore::new()).await;
    }

    #[tokio::test]
    async fn test_redb_schedule_crud() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::create(dir.path().join("state.redb")).unwrap());
        check_crud(&RedbScheduleStore::new(db).unwrap()).await;
    }

    #[tokio::test]
    async fn test_memory_list_due() {
        check_list_due(&MemoryScheduleStore::new()).await;
    }

    #[tokio::test]
    async fn test_redb_list_due() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::create(dir.path().join("state.redb")).unwrap());
        check_list_due(&RedbScheduleStore::new(db).unwrap()).await;
    }

    #[tokio::test]
    async fn test_memory_cascade_delete() {
        check_cascade(&MemoryScheduleStore::new()).await;
    }

    #[tokio::test]
    async fn test_redb_cascade_delete() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::create(dir.path().join("state.redb")).unwrap());
        check_cascade(&RedbScheduleStore::new(db).unwrap()).await;
    }
}
