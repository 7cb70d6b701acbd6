use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trellis_core::graph::GraphDef;
use trellis_core::schedule::ScheduleStore;
use trellis_core::types::WorkflowId;
use trellis_core::workflow::{WorkflowRecord, WorkflowStore};

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowRecord>,
}

pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state.workflow_store.list().await?;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowRecord>> {
    let workflow_id = WorkflowId::new(workflow_id);
    let record = state
        .workflow_store
        .get(&workflow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workflow {} not found", workflow_id)))?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub graph: Option<GraphDef>,
}

/// Create (or overwrite) a workflow. The graph, when present, must already
/// be a valid compiled definition.
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWorkflowRequest>,
) -> ApiResult<Json<WorkflowRecord>> {
    if let Some(graph) = &request.graph {
        graph
            .validate()
            .map_err(|e| ApiError::validation("invalid_graph", e.to_string()))?;
    }

    let now = Utc::now();
    let record = WorkflowRecord {
        id: WorkflowId::new(
            request
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ),
        name: request.name,
        description: request.description,
        graph: request.graph,
        created_at: now,
        updated_at: now,
    };

    state.workflow_store.put(record.clone()).await?;
    tracing::info!(workflow_id = %record.id, "created workflow");

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct UpdateWorkflowRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub graph: Option<GraphDef>,
}

pub async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(request): Json<UpdateWorkflowRequest>,
) -> ApiResult<Json<WorkflowRecord>> {
    let workflow_id = WorkflowId::new(workflow_id);
    let mut record = state
        .workflow_store
        .get(&workflow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workflow {} not found", workflow_id)))?;

    if let Some(graph) = &request.graph {
        graph
            .validate()
            .map_err(|e| ApiError::validation("invalid_graph", e.to_string()))?;
    }

    if let Some(name) = request.name {
        record.name = name;
    }
    if let Some(description) = request.description {
        record.description = Some(description);
    }
    if let Some(graph) = request.graph {
        record.graph = Some(graph);
    }
    record.updated_at = Utc::now();

    state.workflow_store.put(record.clone()).await?;
    tracing::info!(workflow_id = %record.id, "updated workflow");

    Ok(Json(record))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteWorkflowResponse {
    pub deleted: bool,
    pub schedules_removed: usize,
}

/// Delete a workflow and cascade to its schedules.
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<DeleteWorkflowResponse>> {
    let workflow_id = WorkflowId::new(workflow_id);

    let deleted = state.workflow_store.delete(&workflow_id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "workflow {} not found",
            workflow_id
        )));
    }

    let schedules_removed = state
        .schedule_store
        .delete_by_workflow(&workflow_id)
        .await?;

    tracing::info!(
        workflow_id = %workflow_id,
        schedules_removed,
        "deleted workflow"
    );

    Ok(Json(DeleteWorkflowResponse {
        deleted,
        schedules_removed,
    }))
}
