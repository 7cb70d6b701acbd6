use crate::graph::GraphDef;
use crate::store::StoreError;
use crate::types::WorkflowId;
use anyhow::Context;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");

/// A stored workflow. The graph is compiled elsewhere; a record without one
/// exists but cannot run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphDef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable workflow records keyed by id.
#[async_trait::async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn put(&self, record: WorkflowRecord) -> Result<(), StoreError>;

    async fn get(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    async fn delete(&self, id: &WorkflowId) -> Result<bool, StoreError>;
}

/// Workflow store on a shared redb database.
pub struct RedbWorkflowStore {
    db: Arc<Database>,
}

impl RedbWorkflowStore {
    pub fn new(db: Arc<Database>) -> Result<Self, StoreError> {
        let write_txn = db.begin_write().context("failed to begin write")?;
        {
            let _table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("failed to open workflows table")?;
        }
        write_txn.commit().context("failed to commit")?;
        Ok(Self { db })
    }
}

#[async_trait::async_trait]
impl WorkflowStore for RedbWorkflowStore {
    async fn put(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(&record).context("failed to serialize workflow")?;

        let write_txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("failed to open workflows table")?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .context("failed to insert workflow")?;
        }
        write_txn.commit().context("failed to commit workflow")?;
        Ok(())
    }

    async fn get(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("failed to open workflows table")?;

        match table.get(id.as_str()).context("failed to get workflow")? {
            Some(guard) => {
                let record: WorkflowRecord = serde_json::from_slice(guard.value())
                    .context("failed to deserialize workflow")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let read_txn = self.db.begin_read().context("failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("failed to open workflows table")?;

        let mut records = Vec::new();
        for item in table.iter().context("failed to iterate workflows")? {
            let (_key, value) = item.context("failed to read workflow")?;
            let record: WorkflowRecord =
                serde_json::from_slice(value.value()).context("failed to deserialize workflow")?;
            records.push(record);
        }
        Ok(records)
    }

    async fn delete(&self, id: &WorkflowId) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write().context("failed to begin write")?;
        let removed = {
            let mut table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("failed to open workflows table")?;
            let removed = table
                .remove(id.as_str())
                .context("failed to remove workflow")?
                .is_some();
            removed
        };
        write_txn.commit().context("failed to commit delete")?;
        Ok(removed)
    }
}

/// In-memory workflow store for tests.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    records: RwLock<HashMap<String, WorkflowRecord>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn put(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap()
            .insert(record.id.to_string(), record);
        Ok(())
    }

    async fn get(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.records.read().unwrap().get(id.as_str()).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut records: Vec<WorkflowRecord> =
            self.records.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(records)
    }

    async fn delete(&self, id: &WorkflowId) -> Result<bool, StoreError> {
        Ok(self.records.write().unwrap().remove(id.as_str()).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> WorkflowRecord {
        WorkflowRecord {
            id: WorkflowId::new(id),
            name: format!("workflow {}", id),
            description: None,
            graph: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_redb_workflow_crud() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::create(dir.path().join("state.redb")).unwrap());
        let store = RedbWorkflowStore::new(db).unwrap();

        store.put(record("wf-1")).await.unwrap();
        store.put(record("wf-2")).await.unwrap();

        let got = store.get(&WorkflowId::new("wf-1")).await.unwrap().unwrap();
        assert_eq!(got.name, "workflow wf-1");

        assert_eq!(store.list().await.unwrap().len(), 2);

        assert!(store.delete(&WorkflowId::new("wf-1")).await.unwrap());
        assert!(!store.delete(&WorkflowId::new("wf-1")).await.unwrap());
        assert!(store.get(&WorkflowId::new("wf-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_workflow_crud() {
        let store = MemoryWorkflowStore::new();
        store.put(record("wf-1")).await.unwrap();
        assert!(store.get(&WorkflowId::new("wf-1")).await.unwrap().is_some());
        assert!(store.delete(&WorkflowId::new("wf-1")).await.unwrap());
        assert!(store.get(&WorkflowId::new("wf-1")).await.unwrap().is_none());
    }
}
