//! Moves events between the broker bridge and the local bus.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lambda_live_bridge::{Bridge, Echo, Inbound, Topics};
use lambda_live_proto::{Event, EventKind};
use lru::LruCache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{EventBus, EventSubscription};
use crate::error::Result;

const DEBUG_ROUTES_CAPACITY: usize = 4096;

/// `requestId -> workerId` for invocations re-addressed in debug mode.
type Routes = Arc<Mutex<LruCache<String, String>>>;

pub struct Relay {
    bus: EventBus,
    bridge: Arc<Bridge>,
    topics: Topics,
    routes: Option<Routes>,
}

impl Relay {
    pub fn new(bus: EventBus, bridge: Arc<Bridge>, topics: Topics, debug: bool) -> Self {
        let capacity = NonZeroUsize::new(DEBUG_ROUTES_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            bus,
            bridge,
            topics,
            routes: debug.then(|| Arc::new(Mutex::new(LruCache::new(capacity)))),
        }
    }

    /// Subscribes to the broadcast topic and spawns the inbound and reply
    /// pumps.
    pub async fn start(
        self,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        let replies = self.bus.subscribe_channel(&[
            EventKind::FunctionAck,
            EventKind::FunctionSuccess,
            EventKind::FunctionError,
        ]);
        self.bridge.subscribe(&self.topics.events()).await?;
        debug!(topic = %self.topics.events(), debug = self.routes.is_some(), "Relay subscribed");

        let inbound_task = tokio::spawn(pump_inbound(
            inbound,
            self.bus.clone(),
            self.routes.clone(),
            cancel.clone(),
        ));
        let reply_task = tokio::spawn(pump_replies(
            replies,
            self.bridge,
            self.topics,
            self.routes,
            cancel,
        ));
        Ok(vec![inbound_task, reply_task])
    }
}

async fn pump_inbound(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    bus: EventBus,
    routes: Option<Routes>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let event = match Event::from_envelope(&message.envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(kind = %message.envelope.kind, topic = %message.topic, error = %e, "Dropping unrecognised envelope");
                continue;
            }
        };

        let event = match (event, &routes) {
            (Event::FunctionInvoked(mut invocation), Some(routes)) => {
                routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(invocation.request_id.clone(), invocation.worker_id.clone());
                invocation.worker_id = invocation.function_id.clone();
                Event::FunctionInvoked(invocation)
            }
            (event, _) => event,
        };

        debug!(kind = %event.kind(), topic = %message.topic, "Inbound event");
        bus.publish(&event);
    }
    debug!("Inbound relay stopped");
}

async fn pump_replies(
    mut replies: EventSubscription,
    bridge: Arc<Bridge>,
    topics: Topics,
    routes: Option<Routes>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = replies.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let (event, echo) = match &routes {
            Some(routes) => match readdress(event, routes) {
                Some(event) => (event, Echo::Allow),
                None => continue,
            },
            None => (event, Echo::Suppress),
        };
        let Some(worker_id) = event.worker_id().map(str::to_string) else {
            continue;
        };

        // Replies go out one at a time so an ack never trails its result.
        let topic = topics.worker(&worker_id);
        if let Err(e) = bridge.publish(&topic, &event, echo).await {
            warn!(topic, kind = %event.kind(), error = %e, "Failed to publish reply");
        }
    }
    debug!("Reply relay stopped");
}

/// Points a reply back at the remote instance that sent the invocation.
fn readdress(event: Event, routes: &Routes) -> Option<Event> {
    let mut routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
    let mut original = |request_id: &str, done: bool| {
        if done {
            routes.pop(request_id)
        } else {
            routes.get(request_id).cloned()
        }
    };

    let event = match event {
        Event::FunctionAck(mut ack) => {
            ack.worker_id = original(&ack.request_id, false)?;
            Event::FunctionAck(ack)
        }
        Event::FunctionSuccess(mut success) => {
            success.worker_id = original(&success.request_id, true)?;
            Event::FunctionSuccess(success)
        }
        Event::FunctionError(mut error) => {
            error.worker_id = original(&error.request_id, true)?;
            Event::FunctionError(error)
        }
        other => other,
    };
    Some(event)
}
