use crate::cron::CronExpr;
use crate::runner::Runner;
use crate::schedule::{ScheduleStore, ScheduleStatus, WorkflowSchedule};
use crate::types::ScheduleId;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_limit: 100,
        }
    }
}

/// Poll-driven cron scheduler. Each tick queries the schedule store for due
/// schedules, suppresses overlaps against its in-flight set, and launches
/// runs on detached tasks so stopping the poller never aborts a run that is
/// already executing.
pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    runner: Arc<Runner>,
    config: SchedulerConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
    state: tokio::sync::Mutex<Option<LoopState>>,
}

struct LoopState {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        runner: Arc<Runner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            runner,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the poll loop: one tick immediately, then every poll interval.
    /// Idempotent; a second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let scheduler = self.clone();
        let stop_signal = stop.clone();

        let handle = tokio::spawn(async move {
            tracing::info!("scheduler started");
            loop {
                scheduler.tick(Utc::now()).await;
                tokio::select! {
                    _ = stop_signal.cancelled() => break,
                    _ = tokio::time::sleep(scheduler.config.poll_interval) => {}
                }
            }
            tracing::info!("scheduler stopped");
        });

        *state = Some(LoopState { stop, handle });
    }

    /// Cancel future ticks and wait for the loop to exit. In-flight
    /// scheduled runs continue under their own contexts.
    pub async fn stop(&self) {
        let state = self.state.lock().await.take();
        if let Some(LoopState { stop, handle }) = state {
            stop.cancel();
            let _ = handle.await;
        }
    }

    /// One scheduling pass at the given reference time. Errors against a
    /// single schedule are persisted on that schedule and never stop the
    /// pass.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let due = match self.schedules.list_due(now, self.config.batch_limit).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("failed to query due schedules: {}", e);
                return;
            }
        };

        for schedule in due {
            if self.in_flight.lock().unwrap().contains(schedule.id.as_str()) {
                self.record_overlap_skip(schedule, now).await;
                continue;
            }
            self.dispatch(schedule, now).await;
        }
    }

    /// The previous firing is still executing: advance `next_run_at`, record
    /// the skip, and do not launch.
    async fn record_overlap_skip(&self, mut schedule: WorkflowSchedule, now: DateTime<Utc>) {
        tracing::warn!(
            schedule_id = %schedule.id,
            workflow_id = %schedule.workflow_id,
            "skipping schedule: previous execution still in flight"
        );

        if let Ok(expr) = CronExpr::parse(&schedule.cron) {
            if let Some(next) = expr.next_after(now) {
                schedule.next_run_at = next;
            }
        }
        schedule.last_status = Some(ScheduleStatus::SkippedOverlap);
        schedule.last_error = Some(
            "previous execution of this schedule was still running at fire time".to_string(),
        );
        schedule.updated_at = now;

        if let Err(e) = self.schedules.put(schedule).await {
            tracing::error!("failed to persist overlap skip: {}", e);
        }
    }

    async fn dispatch(&self, mut schedule: WorkflowSchedule, now: DateTime<Utc>) {
        let next = CronExpr::parse(&schedule.cron).and_then(|expr| {
            expr.next_after(now)
                .ok_or_else(|| crate::cron::CronError::Parse("expression never fires again".into()))
        });

        let next = match next {
            Ok(next) => next,
            Err(e) => {
                schedule.last_status = Some(ScheduleStatus::Failed);
                schedule.last_error = Some(e.to_string());
                schedule.updated_at = now;
                if let Err(e) = self.schedules.put(schedule).await {
                    tracing::error!("failed to persist schedule failure: {}", e);
                }
                return;
            }
        };

        schedule.next_run_at = next;
        schedule.last_status = Some(ScheduleStatus::Running);
        schedule.last_error = None;
        schedule.updated_at = now;

        if let Err(e) = self.schedules.put(schedule.clone()).await {
            tracing::error!(schedule_id = %schedule.id, "failed to persist schedule launch: {}", e);
            return;
        }

        self.in_flight
            .lock()
            .unwrap()
            .insert(schedule.id.to_string());

        // Detached from the poller: stopping the scheduler must not abort
        // a run that already started.
        let runner = self.runner.clone();
        let schedules = self.schedules.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let schedule_id = schedule.id.clone();
            tracing::info!(
                schedule_id = %schedule_id,
                workflow_id = %schedule.workflow_id,
                "executing scheduled workflow"
            );

            let result = runner.run_scheduled(&schedule).await;
            record_outcome(schedules.as_ref(), schedule, result).await;

            in_flight.lock().unwrap().remove(schedule_id.as_str());
        });
    }

    #[cfg(test)]
    pub(crate) fn mark_in_flight(&self, id: &ScheduleId) {
        self.in_flight.lock().unwrap().insert(id.to_string());
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self, id: &ScheduleId) -> bool {
        self.in_flight.lock().unwrap().contains(id.as_str())
    }
}

/// Stamp the outcome onto the schedule. Re-reads the stored row first:
/// another actor may have edited the schedule while the run executed.
async fn record_outcome(
    schedules: &dyn ScheduleStore,
    fallback: WorkflowSchedule,
    result: Result<crate::types::RunResponse, crate::runner::RunError>,
) {
    let id = fallback.id.clone();
    let mut current = match schedules.get(&id).await {
        Ok(Some(current)) => current,
        Ok(None) => {
            tracing::debug!(schedule_id = %id, "schedule deleted while run was executing");
            return;
        }
        Err(e) => {
            tracing::error!("failed to re-read schedule after run: {}", e);
            fallback
        }
    };

    current.last_run_at = Some(Utc::now());
    match result {
        Ok(response) => {
            current.last_run_id = Some(response.run_id);
            current.last_status = Some(ScheduleStatus::Completed);
            current.last_error = None;
        }
        Err(e) => {
            tracing::error!(schedule_id = %id, "scheduled run failed: {}", e);
            current.last_status = Some(ScheduleStatus::Failed);
            current.last_error = Some(e.to_string());
        }
    }
    current.updated_at = Utc::now();

    if let Err(e) = schedules.put(current).await {
        tracing::error!("failed to persist schedule outcome: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeDef, GraphDef, NodeDef};
    use crate::runtime::test_nodes::TestFactory;
    use crate::schedule::MemoryScheduleStore;
    use crate::types::WorkflowId;
    use crate::workflow::{MemoryWorkflowStore, WorkflowRecord, WorkflowStore};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn workflow(id: &str) -> WorkflowRecord {
        WorkflowRecord {
            id: WorkflowId::new(id),
            name: id.to_string(),
            description: None,
            graph: Some(GraphDef {
                entry: "a".to_string(),
                nodes: vec![
                    NodeDef {
                        id: "a".to_string(),
                        kind: "visit".to_string(),
                        config: json!({}),
                    },
                    NodeDef {
                        id: "b".to_string(),
                        kind: "visit".to_string(),
                        config: json!({}),
                    },
                ],
                edges: vec![EdgeDef {
                    from: "a".to_string(),
                    to: "b".to_string(),
                    label: None,
                }],
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn fixture() -> (Arc<Scheduler>, Arc<MemoryScheduleStore>) {
        let workflows = Arc::new(MemoryWorkflowStore::new());
        workflows.put(workflow("wf-1")).await.unwrap();

        let runner = Arc::new(Runner::new(workflows, Arc::new(TestFactory)));
        let schedules = Arc::new(MemoryScheduleStore::new());
        let scheduler = Arc::new(Scheduler::new(
            schedules.clone(),
            runner,
            SchedulerConfig::default(),
        ));
        (scheduler, schedules)
    }

    async fn wait_for<F>(schedules: &MemoryScheduleStore, id: &ScheduleId, predicate: F)
    where
        F: Fn(&WorkflowSchedule) -> bool,
    {
        for _ in 0..200 {
            if let Some(schedule) = schedules.get(id).await.unwrap() {
                if predicate(&schedule) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("schedule never reached expected state");
    }

    #[tokio::test]
    async fn test_due_schedule_launches_and_records_completion() {
        let (scheduler, schedules) = fixture().await;

        let now = Utc::now();
        let schedule = WorkflowSchedule::new(
            WorkflowId::new("wf-1"),
            "* * * * *".to_string(),
            now - ChronoDuration::seconds(60),
        );
        let id = schedule.id.clone();
        schedules.put(schedule).await.unwrap();

        scheduler.tick(now).await;

        // The launch is persisted before the run resolves.
        let launched = schedules.get(&id).await.unwrap().unwrap();
        assert!(launched.next_run_at > now);

        wait_for(&schedules, &id, |s| {
            s.last_status == Some(ScheduleStatus::Completed)
        })
        .await;

        let done = schedules.get(&id).await.unwrap().unwrap();
        assert!(done.last_run_id.is_some());
        assert!(done.last_run_at.is_some());
        assert!(done.last_error.is_none());
        assert!(!scheduler.is_in_flight(&id));
    }

    #[tokio::test]
    async fn test_overlap_is_skipped_once_and_advances_next_run() {
        let (scheduler, schedules) = fixture().await;

        let now = Utc::now();
        let schedule = WorkflowSchedule::new(
            WorkflowId::new("wf-1"),
            "* * * * *".to_string(),
            now - ChronoDuration::seconds(60),
        );
        let id = schedule.id.clone();
        schedules.put(schedule).await.unwrap();

        scheduler.mark_in_flight(&id);
        scheduler.tick(now).await;

        let skipped = schedules.get(&id).await.unwrap().unwrap();
        assert_eq!(skipped.last_status, Some(ScheduleStatus::SkippedOverlap));
        assert!(skipped.last_error.is_some());
        assert!(skipped.next_run_at > now);
        // No second execution started; the original marker is untouched.
        assert!(scheduler.is_in_flight(&id));
    }

    #[tokio::test]
    async fn test_invalid_cron_is_recorded_as_failed() {
        let (scheduler, schedules) = fixture().await;

        let now = Utc::now();
        let mut schedule = WorkflowSchedule::new(
            WorkflowId::new("wf-1"),
            "not a cron".to_string(),
            now - ChronoDuration::seconds(60),
        );
        schedule.cron = "not a cron".to_string();
        let id = schedule.id.clone();
        schedules.put(schedule).await.unwrap();

        scheduler.tick(now).await;

        let failed = schedules.get(&id).await.unwrap().unwrap();
        assert_eq!(failed.last_status, Some(ScheduleStatus::Failed));
        assert!(failed.last_error.is_some());
    }

    #[tokio::test]
    async fn test_run_failure_is_recorded() {
        let workflows = Arc::new(MemoryWorkflowStore::new());
        // No workflow stored: the scheduled run fails at plan time.
        let runner = Arc::new(Runner::new(workflows, Arc::new(TestFactory)));
        let schedules = Arc::new(MemoryScheduleStore::new());
        let scheduler = Arc::new(Scheduler::new(
            schedules.clone(),
            runner,
            SchedulerConfig::default(),
        ));

        let now = Utc::now();
        let schedule = WorkflowSchedule::new(
            WorkflowId::new("wf-missing"),
            "* * * * *".to_string(),
            now - ChronoDuration::seconds(60),
        );
        let id = schedule.id.clone();
        schedules.put(schedule).await.unwrap();

        scheduler.tick(now).await;
        wait_for(&schedules, &id, |s| {
            s.last_status == Some(ScheduleStatus::Failed)
        })
        .await;

        let failed = schedules.get(&id).await.unwrap().unwrap();
        assert!(failed.last_error.as_deref().unwrap_or("").contains("not found"));
        assert!(failed.last_run_id.is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_waits() {
        let (scheduler, _schedules) = fixture().await;

        scheduler.start().await;
        scheduler.start().await;
        scheduler.stop().await;
        // A second stop on an already-stopped scheduler is a no-op.
        scheduler.stop().await;
    }
}
