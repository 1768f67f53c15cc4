use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{Broker, BrokerMessage};
use crate::error::BrokerError;

struct Client {
    subscriptions: HashSet<String>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<u64, Client>,
    next_id: u64,
    published: Vec<BrokerMessage>,
    duplicate_deliveries: bool,
}

/// An in-process broker with MQTT-like fan-out, used for loopback sessions and
/// tests. Every publish is recorded so callers can inspect the wire traffic.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new client connection on this hub.
    pub async fn connect(&self) -> (Arc<MemoryBroker>, mpsc::UnboundedReceiver<BrokerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.clients.insert(
            id,
            Client {
                subscriptions: HashSet::new(),
                tx,
            },
        );
        let broker = MemoryBroker {
            hub: self.clone(),
            id,
        };
        (Arc::new(broker), rx)
    }

    /// Delivers every message twice from now on, emulating at-least-once
    /// redelivery.
    pub async fn set_duplicate_deliveries(&self, enabled: bool) {
        self.state.lock().await.duplicate_deliveries = enabled;
    }

    /// Clients whose receiver has not been dropped, as of the last publish.
    pub async fn connected(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Every message published so far, in publish order.
    pub async fn published(&self) -> Vec<BrokerMessage> {
        self.state.lock().await.published.clone()
    }

    /// Messages published to one topic.
    pub async fn published_to(&self, topic: &str) -> Vec<BrokerMessage> {
        self.published()
            .await
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

pub struct MemoryBroker {
    hub: MemoryHub,
    id: u64,
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.hub.state.lock().await;
        let client = state.clients.get_mut(&self.id).ok_or(BrokerError::Closed)?;
        client.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.hub.state.lock().await;
        let message = BrokerMessage {
            topic: topic.to_string(),
            payload,
        };
        let copies = if state.duplicate_deliveries { 2 } else { 1 };
        // A dropped receiver is a disconnected client.
        state.clients.retain(|_, client| {
            if !client.subscriptions.contains(topic) {
                return !client.tx.is_closed();
            }
            (0..copies).all(|_| client.tx.send(message.clone()).is_ok())
        });
        state.published.push(message);
        Ok(())
    }
}
