use crate::runner::{RunError, RunRequest, Runner};
use crate::types::{RunResponse, TriggerMeta, WorkflowId};
use crate::workflow::WorkflowStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// The key under which the inbound request lands in the envelope's variable
/// bag.
pub const REQUEST_VAR: &str = "webhook.request";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("workflow {0} has no compiled graph")]
    NotCompiled(WorkflowId),

    #[error("workflow has no trigger node {0}")]
    TriggerNotFound(String),

    #[error("trigger {trigger_id} has invalid configuration: {reason}")]
    InvalidTrigger { trigger_id: String, reason: String },

    #[error("method {0} is not allowed for this trigger")]
    MethodNotAllowed(String),

    #[error("webhook authentication failed")]
    Unauthorized,

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl WebhookError {
    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::WorkflowNotFound(_) => "not_found",
            WebhookError::NotCompiled(_) => "not_compiled",
            WebhookError::TriggerNotFound(_) => "not_found",
            WebhookError::InvalidTrigger { .. } => "invalid_trigger",
            WebhookError::MethodNotAllowed(_) => "method_not_allowed",
            WebhookError::Unauthorized => "unauthorized",
            WebhookError::InvalidBody(_) => "invalid_body",
            WebhookError::Store(_) => "store_error",
            WebhookError::Run(e) => e.code(),
        }
    }
}

/// An inbound HTTP trigger call, framed by the server layer. Header names
/// are lower-cased.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    pub query: Map<String, Value>,
    pub headers: Map<String, Value>,
    pub remote_addr: String,
    pub received_at: DateTime<Utc>,
    pub body: Value,
}

/// Decode a request body per its content type: JSON when the content type
/// says so, raw string otherwise, null when empty.
pub fn decode_body(content_type: Option<&str>, bytes: &[u8]) -> Result<Value, WebhookError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }

    let is_json = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim() == "application/json")
        .unwrap_or(false);

    if is_json {
        serde_json::from_slice(bytes).map_err(|e| WebhookError::InvalidBody(e.to_string()))
    } else {
        Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Per-trigger settings carried in the trigger node's compiled config.
#[derive(Debug, Clone, Default, Deserialize)]
struct TriggerConfig {
    /// Allowed HTTP methods; empty allows any method.
    #[serde(default)]
    methods: Vec<String>,
    #[serde(default)]
    auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthConfig {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    header: Option<String>,
    /// Literal token, or `env:NAME` to read it from the environment.
    #[serde(default)]
    token: Option<String>,
}

/// Validates inbound trigger calls and feeds them into the synchronous run
/// orchestrator path with webhook trigger metadata.
pub struct WebhookDispatcher {
    workflows: Arc<dyn WorkflowStore>,
    runner: Arc<Runner>,
}

impl WebhookDispatcher {
    pub fn new(workflows: Arc<dyn WorkflowStore>, runner: Arc<Runner>) -> Self {
        Self { workflows, runner }
    }

    pub async fn dispatch(
        &self,
        workflow_id: &WorkflowId,
        trigger_id: &str,
        request: WebhookRequest,
    ) -> Result<RunResponse, WebhookError> {
        let record = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| WebhookError::WorkflowNotFound(workflow_id.clone()))?;

        let graph = record
            .graph
            .clone()
            .ok_or_else(|| WebhookError::NotCompiled(workflow_id.clone()))?;

        let node = graph
            .node(trigger_id)
            .filter(|n| n.kind.starts_with("trigger"))
            .ok_or_else(|| WebhookError::TriggerNotFound(trigger_id.to_string()))?;

        let config: TriggerConfig = serde_json::from_value(node.config.clone()).map_err(|e| {
            WebhookError::InvalidTrigger {
                trigger_id: trigger_id.to_string(),
                reason: e.to_string(),
            }
        })?;

        if !config.methods.is_empty()
            && !config
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&request.method))
        {
            return Err(WebhookError::MethodNotAllowed(request.method.clone()));
        }

        check_auth(config.auth.as_ref(), trigger_id, &request)?;

        let payload = json!({
            "workflow_id": workflow_id,
            "trigger_id": trigger_id,
            "method": request.method,
            "path": request.path,
            "query": request.query,
            "headers": request.headers,
            "remote_addr": request.remote_addr,
            "received_at": request.received_at,
            "body": request.body,
        });

        let mut input = Map::new();
        input.insert(REQUEST_VAR.to_string(), payload);

        let run_request = RunRequest {
            input: Value::Object(input),
            options: Default::default(),
        };

        // Execution enters the graph at the trigger node.
        let plan =
            self.runner
                .plan_with_graph(&record, graph.with_entry(trigger_id), run_request)?;

        let response = self
            .runner
            .execute(
                plan,
                TriggerMeta::Webhook {
                    trigger_id: trigger_id.to_string(),
                },
            )
            .await?;

        Ok(response)
    }
}

fn check_auth(
    auth: Option<&AuthConfig>,
    trigger_id: &str,
    request: &WebhookRequest,
) -> Result<(), WebhookError> {
    let Some(auth) = auth else {
        return Ok(());
    };

    match auth.mode.as_str() {
        "" | "none" => Ok(()),
        "header_token" => {
            let configured = auth.token.as_deref().ok_or_else(|| {
                WebhookError::InvalidTrigger {
                    trigger_id: trigger_id.to_string(),
                    reason: "header_token auth requires a token".to_string(),
                }
            })?;
            let expected = resolve_token(configured, trigger_id)?;

            let header = auth
                .header
                .as_deref()
                .unwrap_or("x-webhook-token")
                .to_ascii_lowercase();
            let presented = request
                .headers
                .get(&header)
                .and_then(Value::as_str)
                .ok_or(WebhookError::Unauthorized)?;

            if tokens_match(&expected, presented) {
                Ok(())
            } else {
                Err(WebhookError::Unauthorized)
            }
        }
        other => Err(WebhookError::InvalidTrigger {
            trigger_id: trigger_id.to_string(),
            reason: format!("unknown auth mode {:?}", other),
        }),
    }
}

fn resolve_token(configured: &str, trigger_id: &str) -> Result<String, WebhookError> {
    match configured.strip_prefix("env:") {
        Some(var) => std::env::var(var).map_err(|_| WebhookError::InvalidTrigger {
            trigger_id: trigger_id.to_string(),
            reason: format!("token environment variable {} is not set", var),
        }),
        None => Ok(configured.to_string()),
    }
}

/// Compare fixed-length digests instead of the raw tokens, so the comparison
/// cost does not depend on where the strings diverge.
fn tokens_match(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeDef, GraphDef, NodeDef};
    use crate::runtime::test_nodes::TestFactory;
    use crate::workflow::{MemoryWorkflowStore, WorkflowRecord};

    fn request(method: &str) -> WebhookRequest {
        WebhookRequest {
            method: method.to_string(),
            path: "/api/workflows/wf-1/webhooks/hook".to_string(),
            query: Map::new(),
            headers: Map::new(),
            remote_addr: "127.0.0.1:9999".to_string(),
            received_at: Utc::now(),
            body: Value::Null,
        }
    }

    fn hooked_workflow(auth: Value) -> WorkflowRecord {
        WorkflowRecord {
            id: WorkflowId::new("wf-1"),
            name: "hooked".to_string(),
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
                        id: "hook".to_string(),
                        kind: "trigger.webhook".to_string(),
                        config: json!({"methods": ["POST"], "auth": auth}),
                    },
                ],
                edges: vec![EdgeDef {
                    from: "hook".to_string(),
                    to: "a".to_string(),
                    label: None,
                }],
            }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn fixture(auth: Value) -> WebhookDispatcher {
        let workflows = Arc::new(MemoryWorkflowStore::new());
        workflows.put(hooked_workflow(auth)).await.unwrap();
        let runner = Arc::new(Runner::new(workflows.clone(), Arc::new(TestFactory)));
        WebhookDispatcher::new(workflows, runner)
    }

    #[tokio::test]
    async fn test_dispatch_runs_from_trigger_node() {
        let dispatcher = fixture(Value::Null).await;

        let response = dispatcher
            .dispatch(&WorkflowId::new("wf-1"), "hook", request("POST"))
            .await
            .unwrap();

        // The run walked hook -> a and carried the request payload.
        assert_eq!(response.output["vars"]["visited"], json!(["hook", "a"]));
        let projected = &response.output["vars"][REQUEST_VAR];
        assert_eq!(projected["method"], json!("POST"));
        assert_eq!(projected["trigger_id"], json!("hook"));
        assert_eq!(projected["body"], Value::Null);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let dispatcher = fixture(Value::Null).await;
        let err = dispatcher
            .dispatch(&WorkflowId::new("wf-1"), "hook", request("DELETE"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "method_not_allowed");
    }

    #[tokio::test]
    async fn test_unknown_trigger() {
        let dispatcher = fixture(Value::Null).await;
        let err = dispatcher
            .dispatch(&WorkflowId::new("wf-1"), "nope", request("POST"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_non_trigger_node_is_not_dispatchable() {
        let dispatcher = fixture(Value::Null).await;
        let err = dispatcher
            .dispatch(&WorkflowId::new("wf-1"), "a", request("POST"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_header_token_auth() {
        let dispatcher = fixture(json!({
            "mode": "header_token",
            "header": "X-Webhook-Token",
            "token": "s3cret",
        }))
        .await;

        // Missing header.
        let err = dispatcher
            .dispatch(&WorkflowId::new("wf-1"), "hook", request("POST"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unauthorized");

        // Wrong token.
        let mut bad = request("POST");
        bad.headers
            .insert("x-webhook-token".to_string(), json!("nope"));
        let err = dispatcher
            .dispatch(&WorkflowId::new("wf-1"), "hook", bad)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unauthorized");

        // Correct token.
        let mut good = request("POST");
        good.headers
            .insert("x-webhook-token".to_string(), json!("s3cret"));
        dispatcher
            .dispatch(&WorkflowId::new("wf-1"), "hook", good)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_env_token_indirection() {
        std::env::set_var("TRELLIS_TEST_HOOK_TOKEN", "from-env");
        let dispatcher = fixture(json!({
            "mode": "header_token",
            "token": "env:TRELLIS_TEST_HOOK_TOKEN",
        }))
        .await;

        let mut good = request("POST");
        good.headers
            .insert("x-webhook-token".to_string(), json!("from-env"));
        dispatcher
            .dispatch(&WorkflowId::new("wf-1"), "hook", good)
            .await
            .unwrap();
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(None, b"").unwrap(), Value::Null);
        assert_eq!(
            decode_body(Some("application/json"), br#"{"k": 1}"#).unwrap(),
            json!({"k": 1})
        );
        assert_eq!(
            decode_body(Some("application/json; charset=utf-8"), b"[1, 2]").unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            decode_body(Some("text/plain"), b"hello").unwrap(),
            json!("hello")
        );
        assert!(decode_body(Some("application/json"), b"{nope").is_err());
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "abcdef"));
    }
}
