use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, OriginalUri, Path, Query, State},
    http::{HeaderMap, Method},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use trellis_core::event::Event;
use trellis_core::history::RunFilter;
use trellis_core::store::EventStore;
use trellis_core::runner::RunRequest;
use trellis_core::types::{RunId, RunResponse, RunSummary, TriggerMeta, WorkflowId};
use trellis_core::webhook::{decode_body, WebhookRequest};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Execute a workflow. `options.stream = true` switches the response to an
/// SSE event stream; otherwise the run executes synchronously and the final
/// response is returned as JSON.
pub async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(request): Json<RunRequest>,
) -> ApiResult<Response> {
    let workflow_id = WorkflowId::new(workflow_id);
    let streaming = request.options.stream;

    let plan = state.runner.plan(&workflow_id, request).await?;

    if streaming {
        let frames = state.runner.execute_streaming(plan, TriggerMeta::Workflow);
        let stream = frames.map(|frame| {
            Ok::<_, Infallible>(
                SseEvent::default()
                    .event(frame.event)
                    .data(frame.data.to_string()),
            )
        });

        Ok(Sse::new(stream)
            .keep_alive(
                KeepAlive::new()
                    .interval(HEARTBEAT_INTERVAL)
                    .text("heartbeat"),
            )
            .into_response())
    } else {
        let response = state.runner.execute(plan, TriggerMeta::Workflow).await?;
        tracing::info!(
            run_id = %response.run_id,
            workflow_id = %response.workflow_id,
            "run completed"
        );
        Ok(Json(response).into_response())
    }
}

/// Inbound webhook trigger: frames the HTTP request and enters the
/// synchronous run path at the trigger node.
pub async fn dispatch_webhook(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, trigger_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<RunResponse>> {
    let workflow_id = WorkflowId::new(workflow_id);

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let body = decode_body(content_type, &body)?;

    let mut header_map = Map::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_ascii_lowercase(), Value::String(value.to_string()));
        }
    }

    let mut query_map = Map::new();
    for (key, value) in query {
        query_map.insert(key, Value::String(value));
    }

    let request = WebhookRequest {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        query: query_map,
        headers: header_map,
        remote_addr: remote_addr.to_string(),
        received_at: chrono::Utc::now(),
        body,
    };

    let response = state
        .webhooks
        .dispatch(&workflow_id, &trigger_id, request)
        .await?;

    tracing::info!(
        run_id = %response.run_id,
        workflow_id = %response.workflow_id,
        trigger_id = %trigger_id,
        "webhook run completed"
    );
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct RunListQuery {
    pub status: Option<String>,
    pub workflow_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSummary>,
}

/// List run summaries, newest first.
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunListQuery>,
) -> ApiResult<Json<ListRunsResponse>> {
    let runs = state
        .history
        .list(&RunFilter {
            status: query.status,
            workflow_id: query.workflow_id,
        })
        .await?;
    Ok(Json(ListRunsResponse { runs }))
}

/// Get one run's reconciled summary.
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunSummary>> {
    let run_id = RunId::from(run_id);
    let summary = state
        .history
        .summarize(&run_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", run_id)))?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    #[serde(default)]
    pub after_seq: u64,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}

/// Replay a run's event log from a cursor.
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let run_id = RunId::from(run_id);
    let events = state
        .event_store
        .list(&run_id, query.after_seq, query.limit)
        .await?;
    Ok(Json(GetRunEventsResponse { events }))
}
