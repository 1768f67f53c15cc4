use std::sync::Arc;

use lambda_live_proto::{
    CHUNK_SIZE, Envelope, Event, Fragment, Reassembler, STORAGE_THRESHOLD, encode_fragments,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::broker::{Broker, BrokerMessage};
use crate::error::BridgeError;
use crate::storage::PayloadStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Characters per fragment.
    pub chunk_size: usize,
    /// Serialized size in bytes above which envelopes go through storage.
    pub threshold: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            threshold: STORAGE_THRESHOLD,
        }
    }
}

/// Whether a publish may be delivered back to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    /// Stamp our source id so the fan-out copy is dropped on arrival.
    Suppress,
    /// Leave the source id empty so every subscriber, us included, sees it.
    Allow,
}

/// A fully decoded envelope and the topic it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub topic: String,
    pub envelope: Envelope,
}

pub struct Bridge {
    broker: Arc<dyn Broker>,
    store: Option<PayloadStore>,
    source_id: String,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Option<PayloadStore>,
        source_id: impl Into<String>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            broker,
            store,
            source_id: source_id.into(),
            config,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.broker.subscribe(topic).await?;
        Ok(())
    }

    pub async fn publish(&self, topic: &str, event: &Event, echo: Echo) -> Result<(), BridgeError> {
        let source_id = match echo {
            Echo::Suppress => self.source_id.as_str(),
            Echo::Allow => "",
        };
        let envelope = event.to_envelope(source_id)?;
        self.publish_envelope(topic, &envelope).await
    }

    /// Sends an envelope as one or more fragments, each acknowledged by the
    /// broker before the next is sent.
    pub async fn publish_envelope(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<(), BridgeError> {
        let mut json = envelope.to_json()?;
        if json.len() > self.config.threshold {
            let size = json.len();
            let store = self
                .store
                .as_ref()
                .ok_or(BridgeError::StorageUnavailable { size })?;
            let pointer = store.put(json.into_bytes()).await?;
            debug!(topic, kind = %envelope.kind, size, key = %pointer.key, "Envelope offloaded to storage");
            json = Envelope::pointer(envelope.source_id.clone(), &pointer).to_json()?;
        }

        let fragments = encode_fragments(&json, self.config.chunk_size);
        let count = fragments.len();
        for fragment in fragments {
            self.broker
                .publish(topic, fragment.to_json()?.into_bytes())
                .await?;
        }
        trace!(topic, kind = %envelope.kind, fragments = count, "Published envelope");
        Ok(())
    }

    /// Spawns the task that turns raw broker messages into envelopes.
    ///
    /// Malformed input is logged and dropped. Pointers are resolved on their
    /// own tasks so a slow download never stalls the rest of the stream.
    pub fn spawn_inbound(
        &self,
        rx: mpsc::UnboundedReceiver<BrokerMessage>,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, inbound_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_inbound(
            rx,
            tx,
            self.store.clone(),
            self.source_id.clone(),
        ));
        (handle, inbound_rx)
    }
}

async fn run_inbound(
    mut rx: mpsc::UnboundedReceiver<BrokerMessage>,
    tx: mpsc::UnboundedSender<Inbound>,
    store: Option<PayloadStore>,
    source_id: String,
) {
    let mut reassembler = Reassembler::new();

    while let Some(message) = rx.recv().await {
        let fragment = match Fragment::from_slice(&message.payload) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Dropping malformed fragment");
                continue;
            }
        };
        let data = match reassembler.push(fragment) {
            Ok(Some(data)) => data,
            Ok(None) => continue,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Dropping invalid fragment");
                continue;
            }
        };
        let envelope = match Envelope::from_json(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Dropping malformed envelope");
                continue;
            }
        };

        if is_echo(&envelope, &source_id) {
            trace!(kind = %envelope.kind, "Dropping self-echo");
            continue;
        }

        if !envelope.is_pointer() {
            if tx
                .send(Inbound {
                    topic: message.topic,
                    envelope,
                })
                .is_err()
            {
                return;
            }
            continue;
        }

        let Some(store) = store.clone() else {
            warn!(topic = %message.topic, "Received storage pointer but no payload store is configured");
            continue;
        };
        let tx = tx.clone();
        let source_id = source_id.clone();
        tokio::spawn(async move {
            match resolve_pointer(&store, &envelope).await {
                Ok(resolved) if is_echo(&resolved, &source_id) => {
                    trace!(kind = %resolved.kind, "Dropping self-echo");
                }
                Ok(resolved) => {
                    let _ = tx.send(Inbound {
                        topic: message.topic,
                        envelope: resolved,
                    });
                }
                Err(e) => warn!(topic = %message.topic, error = %e, "Failed to resolve storage pointer"),
            }
        });
    }
}

fn is_echo(envelope: &Envelope, source_id: &str) -> bool {
    !envelope.source_id.is_empty() && envelope.source_id == source_id
}

async fn resolve_pointer(
    store: &PayloadStore,
    envelope: &Envelope,
) -> Result<Envelope, BridgeError> {
    let pointer = envelope.pointer_properties()?;
    let data = store.take(&pointer).await?;
    Ok(Envelope::from_slice(&data)?)
}
