use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use trellis_core::cron::CronExpr;
use trellis_core::human::HumanPolicy;
use trellis_core::schedule::{ScheduleStore, WorkflowSchedule};
use trellis_core::types::{parse_duration, RunOptions, ScheduleId, WorkflowId};
use trellis_core::workflow::WorkflowStore;

/// Schedules carry the run options of the runs they launch; streaming makes
/// no sense without a client attached, so it is rejected up front.
fn validate_options(options: &RunOptions) -> Result<(), ApiError> {
    if options.stream {
        return Err(ApiError::validation(
            "stream_unsupported",
            "streaming is not supported for scheduled runs",
        ));
    }
    if let Some(timeout) = &options.timeout {
        parse_duration(timeout)
            .map_err(|e| ApiError::validation("invalid_timeout", e))?;
    }
    HumanPolicy::from_options(options.human.as_ref())
        .map_err(|e| ApiError::validation("invalid_human_options", e))?;
    Ok(())
}

fn parse_cron(expr: &str) -> Result<CronExpr, ApiError> {
    CronExpr::parse(expr).map_err(|e| ApiError::validation("invalid_cron", e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleListQuery {
    pub workflow_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSchedulesResponse {
    pub schedules: Vec<WorkflowSchedule>,
}

pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScheduleListQuery>,
) -> ApiResult<Json<ListSchedulesResponse>> {
    let mut schedules = state.schedule_store.list().await?;
    if let Some(workflow_id) = query.workflow_id {
        schedules.retain(|s| s.workflow_id.as_str() == workflow_id);
    }
    Ok(Json(ListSchedulesResponse { schedules }))
}

pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
) -> ApiResult<Json<WorkflowSchedule>> {
    let schedule_id = ScheduleId(schedule_id);
    let schedule = state
        .schedule_store
        .get(&schedule_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("schedule {} not found", schedule_id)))?;
    Ok(Json(schedule))
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub workflow_id: String,
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub options: RunOptions,
}

fn default_enabled() -> bool {
    true
}

pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResult<Json<WorkflowSchedule>> {
    let workflow_id = WorkflowId::new(request.workflow_id);
    if state.workflow_store.get(&workflow_id).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "workflow {} not found",
            workflow_id
        )));
    }

    let expr = parse_cron(&request.cron)?;
    validate_options(&request.options)?;

    let next_run_at = expr.next_after(Utc::now()).ok_or_else(|| {
        ApiError::validation("invalid_cron", "cron expression never fires")
    })?;

    let mut schedule = WorkflowSchedule::new(workflow_id, request.cron, next_run_at);
    schedule.enabled = request.enabled;
    schedule.input = request.input;
    schedule.options = request.options;

    state.schedule_store.put(schedule.clone()).await?;
    tracing::info!(
        schedule_id = %schedule.id,
        workflow_id = %schedule.workflow_id,
        next_run_at = %schedule.next_run_at,
        "created schedule"
    );

    Ok(Json(schedule))
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    pub cron: Option<String>,
    pub enabled: Option<bool>,
    pub input: Option<Map<String, Value>>,
    pub options: Option<RunOptions>,
}

pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
    Json(request): Json<UpdateScheduleRequest>,
) -> ApiResult<Json<WorkflowSchedule>> {
    let schedule_id = ScheduleId(schedule_id);
    let mut schedule = state
        .schedule_store
        .get(&schedule_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("schedule {} not found", schedule_id)))?;

    if let Some(options) = &request.options {
        validate_options(options)?;
    }

    let was_enabled = schedule.enabled;
    if let Some(enabled) = request.enabled {
        schedule.enabled = enabled;
    }
    if let Some(input) = request.input {
        schedule.input = input;
    }
    if let Some(options) = request.options {
        schedule.options = options;
    }

    // A new expression, or re-enabling, resets the fire computation so
    // `next_run_at` is strictly after now.
    let cron_changed = request.cron.is_some();
    if let Some(cron) = request.cron {
        schedule.cron = cron;
    }
    if schedule.enabled && (cron_changed || !was_enabled) {
        let expr = parse_cron(&schedule.cron)?;
        schedule.next_run_at = expr.next_after(Utc::now()).ok_or_else(|| {
            ApiError::validation("invalid_cron", "cron expression never fires")
        })?;
    }
    schedule.updated_at = Utc::now();

    state.schedule_store.put(schedule.clone()).await?;
    tracing::info!(schedule_id = %schedule.id, "updated schedule");

    Ok(Json(schedule))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteScheduleResponse {
    pub deleted: bool,
}

pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<String>,
) -> ApiResult<Json<DeleteScheduleResponse>> {
    let schedule_id = ScheduleId(schedule_id);
    let deleted = state.schedule_store.delete(&schedule_id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "schedule {} not found",
            schedule_id
        )));
    }

    tracing::info!(schedule_id = %schedule_id, "deleted schedule");
    Ok(Json(DeleteScheduleResponse { deleted }))
}
