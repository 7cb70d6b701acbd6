use crate::bus::{EventBus, Subscription};
use crate::emitter::{
    DecoratedSink, EventDecorator, EventSink, FanoutSink, SequencerSink, TelemetrySink,
    TraceDecorator, TriggerDecorator,
};
use crate::envelope::Envelope;
use crate::event::Event;
use crate::human::HumanPolicy;
use crate::providers::ProviderMap;
use crate::runtime::{ExecutableGraph, HydrateError, NodeFactory, Runtime, RuntimeError, RuntimeOptions};
use crate::schedule::WorkflowSchedule;
use crate::store::EventStore;
use crate::throttle::{ThrottledEmitter, DEFAULT_COALESCE_INTERVAL};
use crate::tools::{EmptyToolRegistry, ToolRegistry, ToolSet};
use crate::tracker::ActiveRuns;
use crate::types::{
    RunId, RunOptions, RunResponse, RunStatus, TriggerMeta, WorkflowId, parse_duration,
    DEFAULT_RUN_TIMEOUT,
};
use crate::workflow::{WorkflowRecord, WorkflowStore};
use chrono::Utc;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the run orchestrator. `code` is the stable identifier
/// the HTTP layer maps onto a status code.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("workflow {0} has no compiled graph")]
    NotCompiled(WorkflowId),

    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("invalid human options: {0}")]
    InvalidHumanOptions(String),

    #[error("streaming is not supported for scheduled runs")]
    StreamUnsupported,

    #[error("failed to build tool set: {0}")]
    Tools(#[source] anyhow::Error),

    #[error(transparent)]
    Hydrate(#[from] HydrateError),

    #[error("run exceeded its timeout of {0:?}")]
    Timeout(Duration),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl RunError {
    pub fn code(&self) -> &'static str {
        match self {
            RunError::WorkflowNotFound(_) => "not_found",
            RunError::NotCompiled(_) => "not_compiled",
            RunError::InvalidTimeout(_) => "invalid_timeout",
            RunError::InvalidHumanOptions(_) => "invalid_human_options",
            RunError::StreamUnsupported => "stream_unsupported",
            RunError::Tools(_) => "hydrate_error",
            RunError::Hydrate(_) => "hydrate_error",
            RunError::Timeout(_) => "timeout",
            RunError::Runtime(_) => "runtime_error",
            RunError::Store(_) => "store_error",
        }
    }
}

/// A run request: free-form JSON input plus options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub options: RunOptions,
}

/// Everything resolved during planning, ready to execute.
#[derive(Debug)]
pub struct RunPlan {
    pub workflow_id: WorkflowId,
    pub graph: ExecutableGraph,
    pub envelope: Envelope,
    pub timeout: Duration,
    pub human: HumanPolicy,
    pub tools: Arc<ToolSet>,
}

/// One frame of a streaming run response: the SSE event name plus the JSON
/// body.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub event: String,
    pub data: Value,
}

impl StreamFrame {
    fn from_event(event: &Event) -> Self {
        Self {
            event: event.kind.as_str().to_string(),
            data: event.to_json(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub default_timeout: Duration,
    pub coalesce_interval: Duration,
    /// How long to wait for in-flight subscription events before synthesising
    /// a terminal frame.
    pub stream_drain_window: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_RUN_TIMEOUT,
            coalesce_interval: DEFAULT_COALESCE_INTERVAL,
            stream_drain_window: Duration::from_millis(100),
        }
    }
}

/// The run orchestrator: plans runs (lookup, validation, hydration), wires
/// the bus, store subscriber, and decorator chain, and executes against the
/// runtime either synchronously or as a stream of SSE frames.
pub struct Runner {
    workflows: Arc<dyn WorkflowStore>,
    factory: Arc<dyn NodeFactory>,
    tools: Arc<dyn ToolRegistry>,
    providers: Arc<ProviderMap>,
    tracker: Arc<ActiveRuns>,
    bus: Option<Arc<EventBus>>,
    store: Option<Arc<dyn EventStore>>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(workflows: Arc<dyn WorkflowStore>, factory: Arc<dyn NodeFactory>) -> Self {
        Self {
            workflows,
            factory,
            tools: Arc::new(EmptyToolRegistry),
            providers: Arc::new(ProviderMap::new()),
            tracker: Arc::new(ActiveRuns::new()),
            bus: None,
            store: None,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_providers(mut self, providers: Arc<ProviderMap>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ActiveRuns>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tracker(&self) -> Arc<ActiveRuns> {
        self.tracker.clone()
    }

    /// Resolve a run request against a stored workflow: lookup, option
    /// validation, tool-set construction, and graph hydration against a
    /// provider snapshot.
    pub async fn plan(
        &self,
        workflow_id: &WorkflowId,
        request: RunRequest,
    ) -> Result<RunPlan, RunError> {
        let record = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| RunError::WorkflowNotFound(workflow_id.clone()))?;

        let graph = record
            .graph
            .clone()
            .ok_or_else(|| RunError::NotCompiled(workflow_id.clone()))?;

        self.plan_with_graph(&record, graph, request)
    }

    /// Plan against an explicit graph definition. Webhook dispatch uses this
    /// to override the entry node.
    pub fn plan_with_graph(
        &self,
        record: &WorkflowRecord,
        graph: crate::graph::GraphDef,
        request: RunRequest,
    ) -> Result<RunPlan, RunError> {
        let timeout = match &request.options.timeout {
            Some(s) => parse_duration(s).map_err(RunError::InvalidTimeout)?,
            None => self.config.default_timeout,
        };

        let human = HumanPolicy::from_options(request.options.human.as_ref())
            .map_err(RunError::InvalidHumanOptions)?;

        let tools = Arc::new(self.tools.build(record).map_err(RunError::Tools)?);

        let providers = self.providers.snapshot();
        let graph = ExecutableGraph::hydrate(&graph, self.factory.as_ref(), &providers)?;

        let envelope = Envelope::from_input(request.input);

        Ok(RunPlan {
            workflow_id: record.id.clone(),
            graph,
            envelope,
            timeout,
            human,
            tools,
        })
    }

    /// Execute a planned run to completion and return the final response.
    pub async fn execute(
        &self,
        mut plan: RunPlan,
        trigger: TriggerMeta,
    ) -> Result<RunResponse, RunError> {
        let run_id = if plan.envelope.trace.run_id.is_empty() {
            RunId::new()
        } else {
            RunId::from(plan.envelope.trace.run_id.clone())
        };
        plan.envelope.trace.run_id = run_id.to_string();
        self.execute_inner(plan, trigger, run_id).await
    }

    /// Execute a schedule's workflow. Scheduled runs never stream.
    pub async fn run_scheduled(
        &self,
        schedule: &WorkflowSchedule,
    ) -> Result<RunResponse, RunError> {
        if schedule.options.stream {
            return Err(RunError::StreamUnsupported);
        }

        let request = RunRequest {
            input: Value::Object(schedule.input.clone()),
            options: schedule.options.clone(),
        };
        let plan = self.plan(&schedule.workflow_id, request).await?;
        self.execute(
            plan,
            TriggerMeta::Schedule {
                schedule_id: schedule.id.clone(),
            },
        )
        .await
    }

    async fn execute_inner(
        &self,
        plan: RunPlan,
        trigger: TriggerMeta,
        run_id: RunId,
    ) -> Result<RunResponse, RunError> {
        let guard = self.tracker.track(run_id.clone());

        let wiring = self.wire(&run_id, &plan.envelope, trigger);

        let cancel = CancellationToken::new();
        let opts = RuntimeOptions {
            workflow_id: plan.workflow_id.clone(),
            sink: wiring.sink.clone(),
            cancel: cancel.clone(),
            human: plan.human.clone(),
            tools: plan.tools.clone(),
        };

        let started_at = Utc::now();
        let result = tokio::time::timeout(
            plan.timeout,
            Runtime::execute(&plan.graph, plan.envelope, &opts),
        )
        .await;
        let completed_at = Utc::now();

        // Flush coalesced deltas, then let the store subscriber finish.
        wiring.throttle.close().await;
        if let Some(subscriber) = wiring.store_subscriber {
            subscriber.finish(self.config.stream_drain_window).await;
        }
        drop(guard);

        let envelope = match result {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(RuntimeError::Cancelled)) => {
                return Err(RunError::Runtime("run cancelled".to_string()));
            }
            Ok(Err(e)) => return Err(RunError::Runtime(e.to_string())),
            Err(_) => {
                cancel.cancel();
                return Err(RunError::Timeout(plan.timeout));
            }
        };

        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Ok(RunResponse {
            run_id,
            workflow_id: plan.workflow_id,
            status: RunStatus::Completed,
            started_at,
            completed_at,
            duration_ms,
            output: envelope.to_json(),
        })
    }

    /// Execute a planned run as a stream of SSE frames. The stream yields a
    /// synthetic `run.started` frame before any runtime event (the bus
    /// subscription exists before the runtime task starts), forwards runtime
    /// events by kind, and terminates after `run.finished` or `run.error`.
    /// Dropping the stream does not cancel the background run.
    pub fn execute_streaming(
        self: &Arc<Self>,
        mut plan: RunPlan,
        trigger: TriggerMeta,
    ) -> impl Stream<Item = StreamFrame> + Send + 'static {
        let runner = self.clone();

        async_stream::stream! {
            let run_id = RunId::new();
            plan.envelope.trace.run_id = run_id.to_string();
            let workflow_id = plan.workflow_id.clone();

            yield StreamFrame {
                event: "run.started".to_string(),
                data: json!({
                    "run_id": run_id,
                    "workflow_id": workflow_id,
                }),
            };

            let Some(bus) = runner.bus.clone() else {
                // No bus: run inline and frame only the boundary.
                let result = runner
                    .execute_inner(plan, trigger, run_id.clone())
                    .await;
                match result {
                    Ok(_) => yield terminal_frame(&run_id, &workflow_id, "completed"),
                    Err(e) => yield error_frame(&run_id, &e),
                }
                return;
            };

            let mut sub = bus.subscribe(run_id.clone());

            let mut handle: JoinHandle<Result<RunResponse, RunError>> = {
                let runner = runner.clone();
                let run_id = run_id.clone();
                tokio::spawn(async move { runner.execute_inner(plan, trigger, run_id).await })
            };

            enum Step {
                Forward(Event),
                SubscriptionLost,
                RuntimeDone(Result<RunResponse, RunError>),
            }

            let mut finished = false;
            let mut outcome: Option<Result<RunResponse, RunError>> = None;

            while !finished && outcome.is_none() {
                let step = tokio::select! {
                    event = sub.recv() => match event {
                        Some(event) => Step::Forward(event),
                        None => Step::SubscriptionLost,
                    },
                    result = &mut handle => Step::RuntimeDone(
                        result.unwrap_or_else(|e| Err(RunError::Runtime(e.to_string()))),
                    ),
                };

                match step {
                    Step::Forward(event) => {
                        let terminal = event.kind.is_terminal();
                        yield StreamFrame::from_event(&event);
                        if terminal {
                            finished = true;
                        }
                    }
                    Step::SubscriptionLost => {
                        // The bus went away mid-run; the run itself carries
                        // on. Wait for it and synthesise completion below.
                        let result = (&mut handle)
                            .await
                            .unwrap_or_else(|e| Err(RunError::Runtime(e.to_string())));
                        outcome = Some(result);
                    }
                    Step::RuntimeDone(result) => outcome = Some(result),
                }
            }

            if finished {
                return;
            }

            let result = outcome.expect("loop exits with an outcome when not finished");
            if let Err(e) = &result {
                yield error_frame(&run_id, e);
            }

            // Drain whatever the subscription still holds before deciding
            // that no terminal event ever arrived.
            let deadline = tokio::time::Instant::now() + runner.config.stream_drain_window;
            while !finished {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, sub.recv()).await {
                    Ok(Some(event)) => {
                        let terminal = event.kind.is_terminal();
                        yield StreamFrame::from_event(&event);
                        if terminal {
                            finished = true;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            sub.close();

            if !finished {
                let status = if result.is_ok() { "completed" } else { "failed" };
                yield terminal_frame(&run_id, &workflow_id, status);
            }
        }
    }

    /// Build the per-run sink chain: decorators (global-process, then
    /// per-run) over the coalescing emitter, fanned out to the bus and the
    /// telemetry log, with the store subscriber draining the bus.
    fn wire(&self, run_id: &RunId, envelope: &Envelope, trigger: TriggerMeta) -> RunWiring {
        let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        if let Some(bus) = &self.bus {
            sinks.push(bus.clone());
        }
        sinks.push(Arc::new(TelemetrySink));

        let store_subscriber = match (&self.bus, &self.store) {
            (Some(bus), Some(store)) => Some(StoreSubscriber::spawn(
                store.clone(),
                bus.subscribe(run_id.clone()),
            )),
            _ => None,
        };

        // The sequencer sits below the throttle: only events that survive
        // coalescing are numbered, which keeps per-run seq gap-free.
        let fanout = Arc::new(FanoutSink::new(sinks));
        let sequencer = Arc::new(SequencerSink::new(fanout));
        let throttle = Arc::new(ThrottledEmitter::new(sequencer, self.config.coalesce_interval));

        let decorators: Vec<Arc<dyn EventDecorator>> = vec![
            Arc::new(TraceDecorator {
                trace_id: envelope.trace.trace_id.clone(),
                span_id: envelope.trace.span_id.clone(),
            }),
            Arc::new(TriggerDecorator::new(trigger)),
        ];
        let sink: Arc<dyn EventSink> = Arc::new(DecoratedSink::new(decorators, throttle.clone()));

        RunWiring {
            sink,
            throttle,
            store_subscriber,
        }
    }
}

struct RunWiring {
    sink: Arc<dyn EventSink>,
    throttle: Arc<ThrottledEmitter>,
    store_subscriber: Option<StoreSubscriber>,
}

fn terminal_frame(run_id: &RunId, workflow_id: &WorkflowId, status: &str) -> StreamFrame {
    StreamFrame {
        event: "run.finished".to_string(),
        data: json!({
            "run_id": run_id,
            "workflow_id": workflow_id,
            "status": status,
        }),
    }
}

fn error_frame(run_id: &RunId, error: &RunError) -> StreamFrame {
    StreamFrame {
        event: "run.error".to_string(),
        data: json!({
            "run_id": run_id,
            "code": error.code(),
            "error": error.to_string(),
        }),
    }
}

/// Drains a bus subscription into the event store. Persistence failures are
/// logged and never abort the run.
struct StoreSubscriber {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl StoreSubscriber {
    fn spawn(store: Arc<dyn EventStore>, mut sub: Subscription) -> Self {
        let stop = CancellationToken::new();
        let stop_signal = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = sub.recv() => match event {
                        Some(event) => {
                            let terminal = event.kind.is_terminal();
                            append_logged(store.as_ref(), event).await;
                            if terminal {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = stop_signal.cancelled() => {
                        // Runtime is done publishing; whatever is buffered is
                        // all there will ever be.
                        while let Some(event) = sub.try_recv() {
                            append_logged(store.as_ref(), event).await;
                        }
                        break;
                    }
                }
            }
            sub.close();
        });

        Self { handle, stop }
    }

    /// Wait for the drain to finish on its own (it stops at the terminal
    /// event), falling back to a forced flush after the grace period.
    async fn finish(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            self.stop.cancel();
            let _ = self.handle.await;
        }
    }
}

async fn append_logged(store: &dyn EventStore, event: Event) {
    let run_id = event.run_id.clone();
    let seq = event.seq;
    if let Err(e) = store.append(event).await {
        tracing::warn!(run_id = %run_id, seq, "failed to persist run event: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::graph::{EdgeDef, GraphDef, NodeDef};
    use crate::history::{RunFilter, RunHistory};
    use crate::runtime::test_nodes::TestFactory;
    use crate::runtime::{Node, NodeContext, NodeOutput};
    use crate::store::MemoryEventStore;
    use crate::workflow::MemoryWorkflowStore;
    use futures::StreamExt;

    struct SleepNode;

    #[async_trait::async_trait]
    impl Node for SleepNode {
        async fn execute(
            &self,
            _ctx: &NodeContext,
            envelope: Envelope,
        ) -> anyhow::Result<NodeOutput> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(NodeOutput::advance(envelope))
        }
    }

    struct SlowFactory;

    impl NodeFactory for SlowFactory {
        fn hydrate(
            &self,
            _def: &NodeDef,
            _providers: &crate::providers::ProviderSnapshot,
        ) -> anyhow::Result<Arc<dyn Node>> {
            Ok(Arc::new(SleepNode))
        }
    }

    fn linear_workflow(id: &str) -> WorkflowRecord {
        WorkflowRecord {
            id: WorkflowId::new(id),
            name: format!("workflow {}", id),
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

    async fn fixture() -> (Arc<Runner>, Arc<EventBus>, Arc<MemoryEventStore>) {
        let workflows = Arc::new(MemoryWorkflowStore::new());
        workflows.put(linear_workflow("wf-1")).await.unwrap();

        let bus = Arc::new(EventBus::new());
        let store = Arc::new(MemoryEventStore::new());
        let runner = Arc::new(
            Runner::new(workflows, Arc::new(TestFactory))
                .with_bus(bus.clone())
                .with_store(store.clone())
                .with_config(RunnerConfig {
                    coalesce_interval: Duration::from_millis(10),
                    ..Default::default()
                }),
        );
        (runner, bus, store)
    }

    #[tokio::test]
    async fn test_sync_run_completes_and_persists() {
        let (runner, _bus, store) = fixture().await;

        let plan = runner
            .plan(&WorkflowId::new("wf-1"), RunRequest::default())
            .await
            .unwrap();
        let response = runner.execute(plan, TriggerMeta::Workflow).await.unwrap();

        assert_eq!(response.status, RunStatus::Completed);
        assert_eq!(response.workflow_id.as_str(), "wf-1");
        assert_eq!(response.output["vars"]["visited"], json!(["a", "b"]));

        let events = store.list(&response.run_id, 0, 0).await.unwrap();
        assert_eq!(events.first().unwrap().kind, EventKind::RunStarted);
        assert_eq!(events.last().unwrap().kind, EventKind::RunFinished);
        assert!(events.windows(2).all(|w| w[0].seq + 1 == w[1].seq));

        // Trigger metadata was stamped before persistence.
        assert_eq!(events[0].payload["trigger"], json!("workflow"));

        // The run is no longer tracked, and history sees it as completed.
        let history = RunHistory::new(store.clone(), runner.tracker());
        let summary = history
            .summarize(&response.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, "completed");
        assert_eq!(summary.workflow_id, "wf-1");
    }

    #[tokio::test]
    async fn test_plan_unknown_workflow() {
        let (runner, _bus, _store) = fixture().await;
        let err = runner
            .plan(&WorkflowId::new("missing"), RunRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_plan_uncompiled_workflow() {
        let workflows = Arc::new(MemoryWorkflowStore::new());
        let mut record = linear_workflow("wf-raw");
        record.graph = None;
        workflows.put(record).await.unwrap();

        let runner = Runner::new(workflows, Arc::new(TestFactory));
        let err = runner
            .plan(&WorkflowId::new("wf-raw"), RunRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_compiled");
    }

    #[tokio::test]
    async fn test_plan_invalid_timeout() {
        let (runner, _bus, _store) = fixture().await;
        let err = runner
            .plan(
                &WorkflowId::new("wf-1"),
                RunRequest {
                    options: RunOptions {
                        timeout: Some("yesterday".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_timeout");
    }

    #[tokio::test]
    async fn test_plan_invalid_human_mode() {
        let (runner, _bus, _store) = fixture().await;
        let err = runner
            .plan(
                &WorkflowId::new("wf-1"),
                RunRequest {
                    options: RunOptions {
                        human: Some(json!({"mode": "telepathy"})),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_human_options");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let workflows = Arc::new(MemoryWorkflowStore::new());
        workflows.put(linear_workflow("wf-slow")).await.unwrap();

        let runner = Runner::new(workflows, Arc::new(SlowFactory));
        let plan = runner
            .plan(
                &WorkflowId::new("wf-slow"),
                RunRequest {
                    options: RunOptions {
                        timeout: Some("50ms".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = runner.execute(plan, TriggerMeta::Workflow).await.unwrap_err();
        assert_eq!(err.code(), "timeout");
        assert!(runner.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_run_rejects_streaming() {
        let (runner, _bus, _store) = fixture().await;
        let schedule = WorkflowSchedule {
            options: RunOptions {
                stream: true,
                ..Default::default()
            },
            ..WorkflowSchedule::new(
                WorkflowId::new("wf-1"),
                "* * * * *".to_string(),
                Utc::now(),
            )
        };
        let err = runner.run_scheduled(&schedule).await.unwrap_err();
        assert_eq!(err.code(), "stream_unsupported");
    }

    #[tokio::test]
    async fn test_streaming_forwards_runtime_events() {
        let (runner, _bus, _store) = fixture().await;

        let plan = runner
            .plan(&WorkflowId::new("wf-1"), RunRequest::default())
            .await
            .unwrap();
        let frames: Vec<StreamFrame> = runner
            .execute_streaming(plan, TriggerMeta::Workflow)
            .collect()
            .await;

        assert_eq!(frames.first().unwrap().event, "run.started");
        assert_eq!(frames.last().unwrap().event, "run.finished");
        assert!(frames.iter().any(|f| f.event == "node.started"));
        assert!(frames.iter().all(|f| f.event != "run.error"));

        // The terminal frame came from the bus, so it is a full event.
        let finished = frames.last().unwrap();
        assert_eq!(finished.data["Kind"], json!("run.finished"));
    }

    #[tokio::test]
    async fn test_streaming_synthesises_completion_when_bus_is_lost() {
        let (runner, bus, _store) = fixture().await;

        // Subscriptions created after close observe immediate end-of-stream,
        // so no runtime event ever reaches the SSE writer.
        bus.close();

        let plan = runner
            .plan(&WorkflowId::new("wf-1"), RunRequest::default())
            .await
            .unwrap();
        let frames: Vec<StreamFrame> = runner
            .execute_streaming(plan, TriggerMeta::Workflow)
            .collect()
            .await;

        let names: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(names.first(), Some(&"run.started"));
        assert_eq!(names.last(), Some(&"run.finished"));
        assert!(names.iter().all(|n| *n != "run.error"));

        let finished = frames.last().unwrap();
        assert_eq!(finished.data["status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_streaming_without_bus_emits_boundary_only() {
        let workflows = Arc::new(MemoryWorkflowStore::new());
        workflows.put(linear_workflow("wf-1")).await.unwrap();
        let runner = Arc::new(Runner::new(workflows, Arc::new(TestFactory)));

        let plan = runner
            .plan(&WorkflowId::new("wf-1"), RunRequest::default())
            .await
            .unwrap();
        let frames: Vec<StreamFrame> = runner
            .execute_streaming(plan, TriggerMeta::Workflow)
            .collect()
            .await;

        let names: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(names, vec!["run.started", "run.finished"]);
    }

    #[tokio::test]
    async fn test_streaming_frames_error() {
        let workflows = Arc::new(MemoryWorkflowStore::new());
        let mut record = linear_workflow("wf-boom");
        record.graph = Some(GraphDef {
            entry: "boom".to_string(),
            nodes: vec![NodeDef {
                id: "boom".to_string(),
                kind: "fail".to_string(),
                config: json!({}),
            }],
            edges: vec![],
        });
        workflows.put(record).await.unwrap();

        let bus = Arc::new(EventBus::new());
        let runner = Arc::new(
            Runner::new(workflows, Arc::new(TestFactory)).with_bus(bus),
        );

        let plan = runner
            .plan(&WorkflowId::new("wf-boom"), RunRequest::default())
            .await
            .unwrap();
        let frames: Vec<StreamFrame> = runner
            .execute_streaming(plan, TriggerMeta::Workflow)
            .collect()
            .await;

        let names: Vec<&str> = frames.iter().map(|f| f.event.as_str()).collect();
        assert!(names.contains(&"run.error"));
        // A terminal frame still closes the stream after an error.
        assert_eq!(names.last(), Some(&"run.finished"));
        let finished = frames.last().unwrap();
        assert_eq!(finished.data["status"], json!("failed"));
    }
}
