use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lambda_live_proto::{Event, EventKind};
use tokio::sync::mpsc;

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;
type Subscribers = HashMap<EventKind, Vec<(u64, Callback)>>;

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    kind: EventKind,
    id: u64,
}

/// In-process typed publish/subscribe.
///
/// Delivery is synchronous on the publishing task, in subscription order.
/// A publish only reaches subscribers registered before it started.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    source_id: String,
    next_id: AtomicU64,
    subscribers: Mutex<Subscribers>,
}

impl EventBus {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                source_id: source_id.into(),
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Identity of this process, stamped on envelopes it sends to the broker.
    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        SubscriptionHandle { kind, id }
    }

    /// Returns false if the handle was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(&handle.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&handle.kind);
        }
        removed
    }

    pub fn publish(&self, event: &Event) {
        let callbacks: Vec<Callback> = match self.lock().get(&event.kind()) {
            Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return,
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Forwards every event of the given kinds into a channel. The
    /// subscriptions are removed when the returned value is dropped.
    pub fn subscribe_channel(&self, kinds: &[EventKind]) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let handles = kinds
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                self.subscribe(*kind, move |event| {
                    let _ = tx.send(event.clone());
                })
            })
            .collect();
        EventSubscription {
            bus: self.clone(),
            handles,
            rx,
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Channel-backed subscription created by [`EventBus::subscribe_channel`].
pub struct EventSubscription {
    bus: EventBus,
    handles: Vec<SubscriptionHandle>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.bus.unsubscribe(handle);
        }
    }
}
