use crate::emitter::{EventDraft, EventSink, RunEmitter};
use crate::envelope::Envelope;
use crate::event::EventKind;
use crate::graph::{EdgeDef, GraphDef, GraphError, NodeDef};
use crate::human::{HumanPolicy, HumanResponse};
use crate::providers::ProviderSnapshot;
use crate::tools::ToolSet;
use crate::types::{RunId, WorkflowId};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What a node hands back: the (possibly mutated) envelope, plus an optional
/// route label selecting among labelled outgoing edges.
pub struct NodeOutput {
    pub envelope: Envelope,
    pub route: Option<String>,
}

impl NodeOutput {
    pub fn advance(envelope: Envelope) -> Self {
        Self {
            envelope,
            route: None,
        }
    }

    pub fn route(envelope: Envelope, label: impl Into<String>) -> Self {
        Self {
            envelope,
            route: Some(label.into()),
        }
    }
}

/// One executable node. Opaque to the substrate: it consumes an envelope and
/// produces one, emitting whatever intermediate events it wants through the
/// context.
#[async_trait::async_trait]
pub trait Node: Send + Sync {
    async fn execute(&self, ctx: &NodeContext, envelope: Envelope) -> anyhow::Result<NodeOutput>;
}

/// Resolves a compiled node definition into an executable node, binding
/// provider clients from the snapshot taken at plan time.
pub trait NodeFactory: Send + Sync {
    fn hydrate(&self, def: &NodeDef, providers: &ProviderSnapshot) -> anyhow::Result<Arc<dyn Node>>;
}

#[derive(Debug, thiserror::Error)]
pub enum HydrateError {
    #[error("invalid graph: {0}")]
    Invalid(#[from] GraphError),

    #[error("failed to hydrate node {id}: {source}")]
    Node {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

struct HydratedNode {
    kind: String,
    node: Arc<dyn Node>,
}

impl std::fmt::Debug for HydratedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HydratedNode")
            .field("kind", &self.kind)
            .finish()
    }
}

/// A compiled graph resolved against a node factory, ready to execute.
#[derive(Debug)]
pub struct ExecutableGraph {
    entry: String,
    nodes: HashMap<String, HydratedNode>,
    edges: HashMap<String, Vec<EdgeDef>>,
}

impl ExecutableGraph {
    pub fn hydrate(
        def: &GraphDef,
        factory: &dyn NodeFactory,
        providers: &ProviderSnapshot,
    ) -> Result<Self, HydrateError> {
        def.validate()?;

        let mut nodes = HashMap::new();
        for node_def in &def.nodes {
            let node = factory
                .hydrate(node_def, providers)
                .map_err(|source| HydrateError::Node {
                    id: node_def.id.clone(),
                    source,
                })?;
            nodes.insert(
                node_def.id.clone(),
                HydratedNode {
                    kind: node_def.kind.clone(),
                    node,
                },
            );
        }

        let mut edges: HashMap<String, Vec<EdgeDef>> = HashMap::new();
        for edge in &def.edges {
            edges.entry(edge.from.clone()).or_default().push(edge.clone());
        }

        Ok(Self {
            entry: def.entry.clone(),
            nodes,
            edges,
        })
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("run cancelled")]
    Cancelled,

    #[error("graph has no node {0}")]
    MissingNode(String),

    #[error("node {node_id} routed to unknown label {route:?}")]
    UnknownRoute { node_id: String, route: String },

    #[error("node {node_id} failed: {source}")]
    Node {
        node_id: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Wiring for one run.
pub struct RuntimeOptions {
    pub workflow_id: WorkflowId,
    pub sink: Arc<dyn EventSink>,
    pub cancel: CancellationToken,
    pub human: HumanPolicy,
    pub tools: Arc<ToolSet>,
}

/// Execution context handed to a node. Lets the node emit output and tool
/// events under its own identity and resolve human-in-the-loop requests
/// under the run's policy.
pub struct NodeContext {
    emitter: Arc<RunEmitter>,
    node_id: String,
    node_kind: String,
    attempt: u32,
    node_started: Instant,
    pub cancel: CancellationToken,
    human: HumanPolicy,
    tools: Arc<ToolSet>,
}

impl NodeContext {
    fn draft(&self, payload: Map<String, Value>) -> EventDraft {
        EventDraft {
            node_id: self.node_id.clone(),
            node_kind: self.node_kind.clone(),
            attempt: self.attempt,
            elapsed: self.node_started.elapsed(),
            payload,
        }
    }

    pub fn run_id(&self) -> &RunId {
        self.emitter.run_id()
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    /// Emit a streaming output chunk. Coalesced downstream: within one flush
    /// interval only the most recent delta per node survives.
    pub fn emit_delta(&self, payload: Map<String, Value>) {
        self.emitter.emit(EventKind::NodeOutputDelta, self.draft(payload));
    }

    /// Emit the node's final output record.
    pub fn emit_output(&self, payload: Map<String, Value>) {
        self.emitter.emit(EventKind::NodeOutputFinal, self.draft(payload));
    }

    /// Invoke a named tool, recording `tool.call` and `tool.result` events
    /// around the invocation.
    pub async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown tool {:?}", name))?
            .clone();

        let mut payload = Map::new();
        payload.insert("tool".to_string(), json!(name));
        payload.insert("args".to_string(), args.clone());
        self.emitter.emit(EventKind::ToolCall, self.draft(payload));

        let result = tool.invoke(args).await;

        let mut payload = Map::new();
        payload.insert("tool".to_string(), json!(name));
        match &result {
            Ok(value) => {
                payload.insert("ok".to_string(), json!(true));
                payload.insert("result".to_string(), value.clone());
            }
            Err(e) => {
                payload.insert("ok".to_string(), json!(false));
                payload.insert("error".to_string(), json!(e.to_string()));
            }
        }
        self.emitter.emit(EventKind::ToolResult, self.draft(payload));

        result
    }

    /// Ask for human input. Under the strict policy this fails the run; the
    /// auto policies synthesize a response (after the configured delay) and
    /// record both sides as events.
    pub async fn request_human(&self, request: Map<String, Value>) -> anyhow::Result<HumanResponse> {
        self.emitter
            .emit(EventKind::HumanRequest, self.draft(request));

        let Some(response) = self.human.resolve() else {
            anyhow::bail!(
                "node {} requires human input and the run's human handling mode is strict; \
                 re-run with human.mode set to auto_approve or auto_reject",
                self.node_id
            );
        };

        if let Some(delay) = self.human.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => anyhow::bail!("run cancelled"),
            }
        }

        let mut payload = Map::new();
        payload.insert("approved".to_string(), json!(response.approved));
        payload.insert("responded_by".to_string(), json!(response.responded_by));
        if let Some(choice) = &response.choice {
            payload.insert("choice".to_string(), json!(choice));
        }
        if let Some(notes) = &response.notes {
            payload.insert("notes".to_string(), json!(notes));
        }
        self.emitter
            .emit(EventKind::HumanResponse, self.draft(payload));

        Ok(response)
    }
}

/// Executes a hydrated graph, publishing the run's totally ordered event
/// sequence through the sink.
pub struct Runtime;

impl Runtime {
    pub async fn execute(
        graph: &ExecutableGraph,
        mut envelope: Envelope,
        opts: &RuntimeOptions,
    ) -> Result<Envelope, RuntimeError> {
        let run_id = if envelope.trace.run_id.is_empty() {
            let id = RunId::new();
            envelope.trace.run_id = id.to_string();
            id
        } else {
            RunId::from(envelope.trace.run_id.clone())
        };

        let emitter = Arc::new(RunEmitter::new(run_id, opts.sink.clone()));
        let run_started = Instant::now();

        let mut payload = Map::new();
        payload.insert("workflow_id".to_string(), json!(opts.workflow_id.as_str()));
        emitter.emit(
            EventKind::RunStarted,
            EventDraft::run_level(Duration::ZERO, payload),
        );

        let mut current = Some(graph.entry.clone());
        while let Some(node_id) = current {
            if opts.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            let hydrated = graph
                .nodes
                .get(&node_id)
                .ok_or_else(|| RuntimeError::MissingNode(node_id.clone()))?;

            let node_started = Instant::now();
            let ctx = NodeContext {
                emitter: emitter.clone(),
                node_id: node_id.clone(),
                node_kind: hydrated.kind.clone(),
                attempt: 1,
                node_started,
                cancel: opts.cancel.clone(),
                human: opts.human.clone(),
                tools: opts.tools.clone(),
            };

            emitter.emit(
                EventKind::NodeStarted,
                EventDraft {
                    node_id: node_id.clone(),
                    node_kind: hydrated.kind.clone(),
                    attempt: 1,
                    elapsed: Duration::ZERO,
                    payload: Map::new(),
                },
            );

            let result = tokio::select! {
                result = hydrated.node.execute(&ctx, envelope) => result,
                _ = opts.cancel.cancelled() => return Err(RuntimeError::Cancelled),
            };

            let output = match result {
                Ok(output) => output,
                Err(source) => {
                    let mut payload = Map::new();
                    payload.insert("status".to_string(), json!("failed"));
                    payload.insert("error".to_string(), json!(source.to_string()));
                    emitter.emit(
                        EventKind::NodeFinished,
                        EventDraft {
                            node_id: node_id.clone(),
                            node_kind: hydrated.kind.clone(),
                            attempt: 1,
                            elapsed: node_started.elapsed(),
                            payload,
                        },
                    );
                    return Err(RuntimeError::Node {
                        node_id,
                        source,
                    });
                }
            };
            envelope = output.envelope;

            let mut payload = Map::new();
            payload.insert("status".to_string(), json!("completed"));
            emitter.emit(
                EventKind::NodeFinished,
                EventDraft {
                    node_id: node_id.clone(),
                    node_kind: hydrated.kind.clone(),
                    attempt: 1,
                    elapsed: node_started.elapsed(),
                    payload,
                },
            );

            current = Self::next_node(graph, &emitter, &node_id, output.route)?;
        }

        let mut payload = Map::new();
        payload.insert("workflow_id".to_string(), json!(opts.workflow_id.as_str()));
        payload.insert("status".to_string(), json!("completed"));
        emitter.emit(
            EventKind::RunFinished,
            EventDraft::run_level(run_started.elapsed(), payload),
        );

        Ok(envelope)
    }

    fn next_node(
        graph: &ExecutableGraph,
        emitter: &RunEmitter,
        node_id: &str,
        route: Option<String>,
    ) -> Result<Option<String>, RuntimeError> {
        let edges = match graph.edges.get(node_id) {
            Some(edges) if !edges.is_empty() => edges,
            _ => return Ok(None),
        };

        match route {
            Some(label) => {
                let edge = edges
                    .iter()
                    .find(|e| e.label.as_deref() == Some(label.as_str()))
                    .ok_or_else(|| RuntimeError::UnknownRoute {
                        node_id: node_id.to_string(),
                        route: label.clone(),
                    })?;

                let mut payload = Map::new();
                payload.insert("from".to_string(), json!(node_id));
                payload.insert("route".to_string(), json!(label));
                payload.insert("to".to_string(), json!(edge.to));
                emitter.emit(
                    EventKind::RouteDecision,
                    EventDraft {
                        node_id: node_id.to_string(),
                        attempt: 1,
                        payload,
                        ..Default::default()
                    },
                );

                Ok(Some(edge.to.clone()))
            }
            // No route chosen: follow the unlabelled edge, or the sole edge.
            None => {
                let edge = edges
                    .iter()
                    .find(|e| e.label.is_none())
                    .or_else(|| edges.first());
                Ok(edge.map(|e| e.to.clone()))
            }
        }
    }
}
