use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, delete, get, post, put},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use trellis_core::runner::RunError;
use trellis_core::store::{EventStore, StoreError};
use trellis_core::webhook::WebhookError;

mod runs;
mod schedules;
mod workflows;

/// Start the API server. Runs until the process receives a shutdown signal,
/// then stops the scheduler and closes the bus and event store.
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState::new(&config)?);

    state.scheduler.start().await;

    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutting down");
    state.scheduler.stop().await;
    state.bus.close();
    state.event_store.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Create the API router
fn create_router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.max_body_bytes;

    Router::new()
        // Health
        .route("/api/health", get(health_check))
        // Workflow management
        .route("/api/workflows", get(workflows::list_workflows))
        .route("/api/workflows", post(workflows::create_workflow))
        .route("/api/workflows/{workflow_id}", get(workflows::get_workflow))
        .route("/api/workflows/{workflow_id}", put(workflows::update_workflow))
        .route("/api/workflows/{workflow_id}", delete(workflows::delete_workflow))
        // Run triggers
        .route("/api/workflows/{workflow_id}/run", post(runs::run_workflow))
        .route(
            "/api/workflows/{workflow_id}/webhooks/{trigger_id}",
            any(runs::dispatch_webhook),
        )
        // Run history
        .route("/api/runs", get(runs::list_runs))
        .route("/api/runs/{run_id}", get(runs::get_run))
        .route("/api/runs/{run_id}/events", get(runs::get_run_events))
        // Schedule management
        .route("/api/schedules", get(schedules::list_schedules))
        .route("/api/schedules", post(schedules::create_schedule))
        .route("/api/schedules/{schedule_id}", get(schedules::get_schedule))
        .route("/api/schedules/{schedule_id}", put(schedules::update_schedule))
        .route("/api/schedules/{schedule_id}", delete(schedules::delete_schedule))
        // Middleware
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "trellis",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Structured API error: `{"error": {"code", "message", "details"?}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Vec<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "not_found" => StatusCode::NOT_FOUND,
        "not_compiled" | "hydrate_error" => StatusCode::UNPROCESSABLE_ENTITY,
        "invalid_timeout" | "invalid_human_options" | "invalid_cron" | "invalid_body"
        | "invalid_trigger" | "stream_unsupported" => StatusCode::BAD_REQUEST,
        "method_not_allowed" => StatusCode::METHOD_NOT_ALLOWED,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        let code = err.code();
        Self::new(status_for_code(code), code, err.to_string())
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        let code = err.code();
        Self::new(status_for_code(code), code, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        )
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for_code("not_found"), StatusCode::NOT_FOUND);
        assert_eq!(status_for_code("not_compiled"), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for_code("hydrate_error"), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for_code("invalid_timeout"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_code("timeout"), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for_code("unauthorized"), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for_code("method_not_allowed"), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(status_for_code("runtime_error"), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_body_shape() {
        let err = ApiError::validation("invalid_cron", "bad expression");
        let body = ErrorBody {
            error: ErrorDetail {
                code: err.code,
                message: err.message,
                details: err.details,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["code"], "invalid_cron");
        assert_eq!(json["error"]["message"], "bad expression");
        assert!(json["error"].get("details").is_none());
    }
}
