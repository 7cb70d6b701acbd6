use crate::event::{Event, EventKind};
use crate::store::{EventStore, StoreError};
use crate::tracker::ActiveRuns;
use crate::types::{RunId, RunSummary};
use serde_json::Value;
use std::sync::Arc;

/// Optional filters for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<String>,
    pub workflow_id: Option<String>,
}

/// Derives per-run summaries from the event log and reconciles the `running`
/// status against the process-local active set.
pub struct RunHistory {
    store: Arc<dyn EventStore>,
    tracker: Arc<ActiveRuns>,
}

impl RunHistory {
    pub fn new(store: Arc<dyn EventStore>, tracker: Arc<ActiveRuns>) -> Self {
        Self { store, tracker }
    }

    /// Fold the run's event log into a summary. `None` when the run has no
    /// events at all.
    pub async fn summarize(&self, run_id: &RunId) -> Result<Option<RunSummary>, StoreError> {
        let events = self.store.list(run_id, 0, 0).await?;
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.fold(run_id, &events)))
    }

    /// Summaries for every run in the store, newest first. Filters apply
    /// after reconciliation, so `status=failed` matches orphaned runs too.
    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let mut summaries = Vec::new();
        for run_id in self.store.run_ids().await? {
            let events = self.store.list(&run_id, 0, 0).await?;
            if events.is_empty() {
                continue;
            }
            let summary = self.fold(&run_id, &events);

            if let Some(status) = &filter.status {
                if summary.status != *status {
                    continue;
                }
            }
            if let Some(workflow_id) = &filter.workflow_id {
                if summary.workflow_id != *workflow_id {
                    continue;
                }
            }
            summaries.push(summary);
        }

        summaries.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.as_str().cmp(a.run_id.as_str()))
        });
        Ok(summaries)
    }

    fn fold(&self, run_id: &RunId, events: &[Event]) -> RunSummary {
        let mut started_at = events[0].time;
        let mut workflow_id = String::new();
        let mut status = "running".to_string();
        let mut completed_at = None;
        let mut finished_elapsed_ns = 0u64;

        for event in events {
            if workflow_id.is_empty() {
                if let Some(Value::String(id)) = event.payload.get("workflow_id") {
                    if matches!(event.kind, EventKind::RunStarted | EventKind::RunFinished) {
                        workflow_id = id.clone();
                    }
                }
            }

            match event.kind {
                EventKind::RunStarted => started_at = event.time,
                EventKind::RunFinished => {
                    completed_at = Some(event.time);
                    finished_elapsed_ns = event.elapsed_ns;
                    status = event
                        .payload
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("completed")
                        .to_string();
                }
                _ => {}
            }
        }

        // An event log that says "running" for a run this process is not
        // executing belongs to a run that died without finishing.
        if status == "running" && !self.tracker.contains(run_id) {
            status = "failed".to_string();
            completed_at = Some(events.last().map(|e| e.time).unwrap_or(started_at));
        }

        let duration_ms = if finished_elapsed_ns > 0 {
            finished_elapsed_ns / 1_000_000
        } else {
            let end = completed_at.unwrap_or_else(|| events.last().unwrap().time);
            (end - started_at).num_milliseconds().max(0) as u64
        };

        RunSummary {
            run_id: run_id.clone(),
            workflow_id,
            status,
            started_at,
            completed_at,
            duration_ms,
        }
    }
}
