use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use super::{Broker, BrokerMessage};
use crate::error::BrokerError;

const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// `mqtt://host:port` or `mqtts://host:port`.
    pub url: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ack_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl MqttConfig {
    pub fn new(url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(30),
            ca_cert: None,
            client_cert: None,
            client_key: None,
            ack_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Maps outgoing packet ids back to the publish call waiting on them.
///
/// rumqttc assigns packet ids inside the event loop, in the order publish
/// requests were queued, so waiters are queued in the same order and bound to
/// an id when the event loop reports the outgoing packet.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn sent(&mut self, pkid: u16) {
        // Retransmissions after a reconnect reuse their id.
        if self.inflight.contains_key(&pkid) {
            return;
        }
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(());
        }
    }

    /// Drops in-flight entries whose publish call stopped waiting. Queued
    /// entries stay, since they still line up with future packet ids.
    fn forget_abandoned(&mut self) {
        self.inflight.retain(|_, waiter| !waiter.is_closed());
    }
}

pub struct MqttBroker {
    client: AsyncClient,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    acks: Arc<Mutex<AckTracker>>,
    send_lock: Mutex<()>,
    ack_timeout: Duration,
}

impl MqttBroker {
    pub async fn connect(
        config: MqttConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<BrokerMessage>), BrokerError> {
        let options = mqtt_options(&config).await?;
        let (client, eventloop) = AsyncClient::new(options, 64);
        let (tx, rx) = mpsc::unbounded_channel();

        let broker = Arc::new(Self {
            client: client.clone(),
            subscriptions: Arc::new(Mutex::new(HashSet::new())),
            acks: Arc::new(Mutex::new(AckTracker::default())),
            send_lock: Mutex::new(()),
            ack_timeout: config.ack_timeout,
        });

        tokio::spawn(drive(
            eventloop,
            client,
            broker.subscriptions.clone(),
            broker.acks.clone(),
            tx,
            config.reconnect_delay,
        ));

        Ok((broker, rx))
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.subscriptions.lock().await.insert(topic.to_string());
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        debug!(topic, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _ordered = self.send_lock.lock().await;
            self.acks.lock().await.queued.push_back(ack_tx);
            if let Err(e) = self
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                self.acks.lock().await.queued.pop_back();
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => {
                self.acks.lock().await.forget_abandoned();
                Err(BrokerError::AckTimeout {
                    topic: topic.to_string(),
                })
            }
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    acks: Arc<Mutex<AckTracker>>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
    reconnect_delay: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Broker connected");
                let topics: Vec<String> = subscriptions.lock().await.iter().cloned().collect();
                let client = client.clone();
                // Requests are drained by this loop, so resubscribe off-loop.
                tokio::spawn(async move {
                    for topic in topics {
                        if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                            warn!(topic, error = %e, "Failed to resubscribe");
                        }
                    }
                });
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BrokerMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if tx.send(message).is_err() {
                    debug!("Inbound receiver dropped, stopping broker loop");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().await.acked(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().await.sent(pkid),
            Ok(Event::Incoming(Packet::Disconnect)) => warn!("Broker requested disconnect"),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Broker connection lost, reconnecting");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

async fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, BrokerError> {
    let invalid = |message: &str| BrokerError::InvalidUrl {
        url: config.url.clone(),
        message: message.to_string(),
    };

    let url = Url::parse(&config.url).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
    };
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut options = MqttOptions::new(config.client_id.clone(), host, port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if tls {
        let ca_path = config
            .ca_cert
            .as_ref()
            .ok_or_else(|| invalid("mqtts requires a CA certificate"))?;
        let ca = tokio::fs::read(ca_path).await?;
        let client_auth = match (&config.client_cert, &config.client_key) {
            (Some(cert), Some(key)) => {
                Some((tokio::fs::read(cert).await?, tokio::fs::read(key).await?))
            }
            _ => None,
        };
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }

    Ok(options)
}
