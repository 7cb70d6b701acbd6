use crate::event::Event;
use crate::types::RunId;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Default bounded capacity of a single subscription's buffer.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

/// In-process fan-out from event publishers to subscribers.
///
/// Publishing never blocks and never waits on a slow subscriber: each
/// subscription owns a bounded buffer and events are dropped for that
/// subscriber alone when its buffer is full. Dropped events are not replayed;
/// a subscriber that needs completeness should replay from the event store.
pub struct EventBus {
    inner: RwLock<BusInner>,
    capacity: usize,
}

struct BusInner {
    closed: bool,
    next_id: u64,
    subscribers: Vec<SubscriberEntry>,
}

struct SubscriberEntry {
    id: u64,
    /// `None` subscribes to every run
    filter: Option<RunId>,
    slot: Arc<SubscriberSlot>,
}

/// Per-subscription delivery state. Has its own lock so delivery to one
/// subscriber never stalls another.
struct SubscriberSlot {
    state: Mutex<SlotState>,
}

struct SlotState {
    closed: bool,
    tx: Option<mpsc::Sender<Event>>,
}

impl SubscriberSlot {
    fn deliver(&self, event: &Event) {
        let state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if let Some(tx) = &state.tx {
            // Full buffer: drop for this subscriber only.
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::debug!(
                    run_id = %event.run_id,
                    seq = event.seq,
                    "subscription buffer full, dropping event"
                );
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.tx = None;
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(BusInner {
                closed: false,
                next_id: 0,
                subscribers: Vec::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Deliver an event to every matching subscriber. Non-blocking; silently
    /// drops everything once the bus is closed.
    pub fn publish(&self, event: &Event) {
        let inner = self.inner.read().unwrap();
        if inner.closed {
            return;
        }

        for entry in &inner.subscribers {
            let matches = match &entry.filter {
                Some(run_id) => *run_id == event.run_id,
                None => true,
            };
            if matches {
                entry.slot.deliver(event);
            }
        }
    }

    /// Subscribe to events for a single run.
    pub fn subscribe(self: &Arc<Self>, run_id: RunId) -> Subscription {
        self.register(Some(run_id))
    }

    /// Subscribe to every event on the bus.
    pub fn subscribe_all(self: &Arc<Self>) -> Subscription {
        self.register(None)
    }

    fn register(self: &Arc<Self>, filter: Option<RunId>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let slot = Arc::new(SubscriberSlot {
            state: Mutex::new(SlotState {
                closed: false,
                tx: Some(tx),
            }),
        });

        let mut inner = self.inner.write().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        if inner.closed {
            // A subscription created after close observes immediate
            // end-of-stream.
            slot.close();
        } else {
            inner.subscribers.push(SubscriberEntry {
                id,
                filter,
                slot: slot.clone(),
            });
        }

        Subscription {
            id,
            bus: Arc::downgrade(self),
            slot,
            rx,
        }
    }

    /// Close the bus and every outstanding subscription. Readers observe
    /// end-of-stream. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for entry in inner.subscribers.drain(..) {
            entry.slot.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().unwrap().closed
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.subscribers.retain(|entry| entry.id != id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle over which one subscriber receives events, in publish order,
/// until it or the bus closes. Buffered up to the bus capacity; overflow is
/// silently lossy (see [`EventBus`]).
pub struct Subscription {
    id: u64,
    bus: std::sync::Weak<EventBus>,
    slot: Arc<SubscriberSlot>,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the subscription is closed
    /// and its buffer is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive of whatever is already buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving events. Closing twice is a no-op.
    pub fn close(&self) {
        self.slot.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
