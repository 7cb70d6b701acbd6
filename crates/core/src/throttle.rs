use crate::emitter::EventSink;
use crate::event::{Event, EventKind};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default flush cadence for coalesced output deltas.
pub const DEFAULT_COALESCE_INTERVAL: Duration = Duration::from_millis(100);

/// Coalesces high-frequency `node.output.delta` events per node, emitting at
/// most one delta per node per flush interval (the most recent one wins).
/// Every other kind passes through immediately, preserving its order with
/// respect to other pass-through events; ordering against coalesced deltas is
/// only flush-boundary ordered.
pub struct ThrottledEmitter {
    inner: Arc<Inner>,
    stop: CancellationToken,
    flusher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    downstream: Arc<dyn EventSink>,
    pending: Mutex<BTreeMap<String, Event>>,
}

impl Inner {
    fn flush(&self) {
        let drained: Vec<Event> = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending).into_values().collect()
        };
        for event in drained {
            self.downstream.emit(event);
        }
    }
}

impl ThrottledEmitter {
    /// Must be called from within a tokio runtime: spawns the flush timer.
    pub fn new(downstream: Arc<dyn EventSink>, interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            downstream,
            pending: Mutex::new(BTreeMap::new()),
        });
        let stop = CancellationToken::new();

        let flusher = {
            let inner = inner.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => {
                            // Final flush before the timer task exits.
                            inner.flush();
                            break;
                        }
                        _ = ticker.tick() => inner.flush(),
                    }
                }
            })
        };

        Self {
            inner,
            stop,
            flusher: tokio::sync::Mutex::new(Some(flusher)),
        }
    }

    /// Flush anything pending and terminate the timer task. Deterministic:
    /// after `close` returns, no further emissions happen.
    pub async fn close(&self) {
        self.stop.cancel();
        let handle = self.flusher.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl EventSink for ThrottledEmitter {
    fn emit(&self, event: Event) {
        if event.kind == EventKind::NodeOutputDelta {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.insert(event.node_id.clone(), event);
        } else {
            // A terminal event must be the last thing downstream sees for
            // this run, so pending deltas go out ahead of it.
            if event.kind.is_terminal() {
                self.inner.flush();
            }
            self.inner.downstream.emit(event);
        }
    }
}
