use crate::bus::EventBus;
use crate::event::{Event, EventKind};
use crate::types::{RunId, TriggerMeta};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A single-method sink for run events. Emission must not block the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl EventSink for EventBus {
    fn emit(&self, event: Event) {
        self.publish(&event);
    }
}

/// Middleware over an [`EventSink`]: may mutate the event before it reaches
/// the sink. Decorators are applied in registration order, global-process
/// ones before per-run ones, and every mutation is visible to the decorators
/// that follow.
pub trait EventDecorator: Send + Sync {
    fn decorate(&self, event: &mut Event);
}

/// Sink wrapper applying a decorator chain before delegating.
pub struct DecoratedSink {
    decorators: Vec<Arc<dyn EventDecorator>>,
    inner: Arc<dyn EventSink>,
}

impl DecoratedSink {
    pub fn new(decorators: Vec<Arc<dyn EventDecorator>>, inner: Arc<dyn EventSink>) -> Self {
        Self { decorators, inner }
    }
}

impl EventSink for DecoratedSink {
    fn emit(&self, mut event: Event) {
        for decorator in &self.decorators {
            decorator.decorate(&mut event);
        }
        self.inner.emit(event);
    }
}

/// Fan a single emission out to several sinks.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Logs every event at debug level.
pub struct TelemetrySink;

impl EventSink for TelemetrySink {
    fn emit(&self, event: Event) {
        tracing::debug!(
            run_id = %event.run_id,
            seq = event.seq,
            kind = %event.kind,
            node_id = %event.node_id,
            "run event"
        );
    }
}

/// Propagates ambient trace identity onto events that carry none.
pub struct TraceDecorator {
    pub trace_id: String,
    pub span_id: String,
}

impl EventDecorator for TraceDecorator {
    fn decorate(&self, event: &mut Event) {
        if event.trace_id.is_empty() {
            event.trace_id = self.trace_id.clone();
        }
        if event.span_id.is_empty() {
            event.span_id = self.span_id.clone();
        }
    }
}

/// Stamps trigger metadata onto the run boundary events.
pub struct TriggerDecorator {
    trigger: TriggerMeta,
}

impl TriggerDecorator {
    pub fn new(trigger: TriggerMeta) -> Self {
        Self { trigger }
    }
}

impl EventDecorator for TriggerDecorator {
    fn decorate(&self, event: &mut Event) {
        if !matches!(event.kind, EventKind::RunStarted | EventKind::RunFinished) {
            return;
        }

        event
            .payload
            .insert("trigger".to_string(), Value::String(self.trigger.kind().to_string()));

        match &self.trigger {
            TriggerMeta::Workflow => {}
            TriggerMeta::Schedule { schedule_id } => {
                event.payload.insert(
                    "schedule_id".to_string(),
                    Value::String(schedule_id.to_string()),
                );
            }
            TriggerMeta::Webhook { trigger_id } => {
                event
                    .payload
                    .insert("trigger_id".to_string(), Value::String(trigger_id.clone()));
            }
        }
    }
}

/// Everything an event needs besides run identity, sequence, and time, which
/// the [`RunEmitter`] supplies.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub node_id: String,
    pub node_kind: String,
    pub attempt: u32,
    pub elapsed: Duration,
    pub payload: Map<String, Value>,
}

impl EventDraft {
    pub fn run_level(elapsed: Duration, payload: Map<String, Value>) -> Self {
        Self {
            attempt: 1,
            elapsed,
            payload,
            ..Default::default()
        }
    }
}

/// Assigns the run's gap-free `seq`, starting at 1, in the order events
/// reach it. Sits downstream of the coalescing emitter so that dropped
/// deltas never leave holes in the sequence and flushed deltas are numbered
/// in delivery order.
pub struct SequencerSink {
    seq: AtomicU64,
    inner: Arc<dyn EventSink>,
}

impl SequencerSink {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self {
            seq: AtomicU64::new(0),
            inner,
        }
    }

    /// Sequence number of the most recently stamped event (0 before any).
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

impl EventSink for SequencerSink {
    fn emit(&self, mut event: Event) {
        event.seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.emit(event);
    }
}

/// Per-run event factory: stamps run identity, time, and node scope onto
/// drafts and hands them to the sink chain. `seq` is left at 0 here; the
/// chain's [`SequencerSink`] numbers events once coalescing has decided
/// which of them survive.
pub struct RunEmitter {
    run_id: RunId,
    sink: Arc<dyn EventSink>,
}

impl RunEmitter {
    pub fn new(run_id: RunId, sink: Arc<dyn EventSink>) -> Self {
        Self { run_id, sink }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn emit(&self, kind: EventKind, draft: EventDraft) {
        let event = Event {
            run_id: self.run_id.clone(),
            seq: 0,
            kind,
            node_id: draft.node_id,
            node_kind: draft.node_kind,
            time: chrono::Utc::now(),
            attempt: draft.attempt.max(1),
            elapsed_ns: draft.elapsed.as_nanos() as u64,
            payload: draft.payload,
            trace_id: String::new(),
            span_id: String::new(),
        };
        self.sink.emit(event);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Collects emitted events for assertions.
    #[derive(Default)]
    pub struct CaptureSink {
        pub events: Mutex<Vec<Event>>,
    }

    impl CaptureSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        pub fn snapshot(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for CaptureSink {
        fn emit(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }
}
