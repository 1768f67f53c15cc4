//! Stand-in for a deployed function's entry point.
//!
//! While live mode is enabled, each real invocation is published to the
//! session's broadcast topic and the stub waits on its own reply topic for
//! the matching `function.success` or `function.error`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lambda_live_bridge::{
    Bridge, BridgeConfig, BridgeError, Broker, BrokerMessage, Echo, Inbound, MqttBroker,
    MqttConfig, PayloadStore, Topics, new_source_id,
};
use lambda_live_proto::{Event, FunctionTimeout, Invocation, InvocationContext};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const ENABLED_ENV: &str = "SLS_LIVE_LAMBDA_ENABLED";
pub const SERVICE_ENV: &str = "SLS_SERVICE_NAME";
pub const STAGE_ENV: &str = "SLS_STAGE";
pub const FUNCTION_NAME_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// Variables owned by the cloud runtime; they are never forwarded.
pub const RESERVED_ENV: [&str; 30] = [
    "SLS_SERVICE_NAME",
    "SLS_STAGE",
    "SLS_LIVE_LAMBDA_ENABLED",
    "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
    "AWS_LAMBDA_LOG_GROUP_NAME",
    "AWS_LAMBDA_LOG_STREAM_NAME",
    "LD_LIBRARY_PATH",
    "LAMBDA_TASK_ROOT",
    "AWS_LAMBDA_RUNTIME_API",
    "AWS_EXECUTION_ENV",
    "AWS_XRAY_DAEMON_ADDRESS",
    "AWS_LAMBDA_INITIALIZATION_TYPE",
    "PATH",
    "PWD",
    "LAMBDA_RUNTIME_DIR",
    "LANG",
    "NODE_PATH",
    "TZ",
    "SHLVL",
    "_AWS_XRAY_DAEMON_ADDRESS",
    "_AWS_XRAY_DAEMON_PORT",
    "AWS_XRAY_CONTEXT_MISSING",
    "_HANDLER",
    "_LAMBDA_CONSOLE_SOCKET",
    "_LAMBDA_CONTROL_SOCKET",
    "_LAMBDA_LOG_FD",
    "_LAMBDA_RUNTIME_LOAD_TIME",
    "_LAMBDA_SB_ID",
    "_LAMBDA_SERVER_PORT",
    "_LAMBDA_SHARED_MEM_FD",
];

#[derive(Debug, Error)]
pub enum StubError {
    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("No reply from the local worker within {0:?}")]
    Timeout(Duration),

    #[error("{error_type}: {error_message}")]
    Handler {
        error_type: String,
        error_message: String,
        trace: Vec<String>,
    },

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Stub connection closed")]
    Closed,
}

/// Whether live mode is switched on for this process.
pub fn is_enabled() -> bool {
    enabled(std::env::var(ENABLED_ENV).ok().as_deref())
}

fn enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true"))
}

/// Drops the variables listed in [`RESERVED_ENV`].
pub fn forwarded_environment(
    vars: impl IntoIterator<Item = (String, String)>,
) -> HashMap<String, String> {
    vars.into_iter()
        .filter(|(name, _)| !RESERVED_ENV.contains(&name.as_str()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct StubConfig {
    pub topics: Topics,
    /// Reply address of this instance, unique per process.
    pub worker_id: String,
    pub function_id: String,
    pub environment: HashMap<String, String>,
}

impl StubConfig {
    pub fn new(topics: Topics, function_id: impl Into<String>) -> Self {
        Self {
            topics,
            worker_id: uuid::Uuid::new_v4().to_string(),
            function_id: function_id.into(),
            environment: HashMap::new(),
        }
    }

    pub fn from_env() -> Result<Self, StubError> {
        let var = |name: &'static str| std::env::var(name).map_err(|_| StubError::MissingEnv(name));
        let topics = Topics::new(&var(SERVICE_ENV)?, &var(STAGE_ENV)?);
        let mut config = Self::new(topics, var(FUNCTION_NAME_ENV)?);
        config.environment = forwarded_environment(std::env::vars());
        Ok(config)
    }
}

/// One remote invocation to forward.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub request_id: String,
    /// Time left before the cloud runtime gives up on the invocation.
    pub remaining: Duration,
    pub event: Value,
    pub context: InvocationContext,
}

#[derive(Debug)]
enum Reply {
    Success(Value),
    Error {
        error_type: String,
        error_message: String,
        trace: Vec<String>,
    },
}

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

pub struct Stub {
    bridge: Arc<Bridge>,
    config: StubConfig,
    waiters: Waiters,
    tasks: Vec<JoinHandle<()>>,
}

impl Stub {
    /// Connects over MQTT, subscribing to this instance's reply topic.
    pub async fn connect_mqtt(
        config: StubConfig,
        mqtt: MqttConfig,
        store: Option<PayloadStore>,
    ) -> Result<Self, StubError> {
        let (broker, inbound) = MqttBroker::connect(mqtt).await.map_err(BridgeError::from)?;
        Self::connect(config, broker, inbound, store).await
    }

    pub async fn connect(
        config: StubConfig,
        broker: Arc<dyn Broker>,
        inbound: mpsc::UnboundedReceiver<BrokerMessage>,
        store: Option<PayloadStore>,
    ) -> Result<Self, StubError> {
        let bridge = Arc::new(Bridge::new(
            broker,
            store,
            new_source_id(),
            BridgeConfig::default(),
        ));
        let (decoder, decoded) = bridge.spawn_inbound(inbound);
        let waiters: Waiters = Arc::default();
        let dispatcher = tokio::spawn(dispatch(
            decoded,
            config.worker_id.clone(),
            waiters.clone(),
        ));

        let topic = config.topics.worker(&config.worker_id);
        bridge.subscribe(&topic).await?;
        info!(worker_id = %config.worker_id, topic = %topic, "Stub connected");

        Ok(Self {
            bridge,
            config,
            waiters,
            tasks: vec![decoder, dispatcher],
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Forwards one invocation and waits for its result.
    ///
    /// When `remaining` elapses first, a `function.timeout` is published and
    /// [`StubError::Timeout`] returned.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<Value, StubError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(request.request_id.clone(), tx);

        let invocation = Event::FunctionInvoked(Invocation {
            worker_id: self.config.worker_id.clone(),
            function_id: self.config.function_id.clone(),
            request_id: request.request_id.clone(),
            deadline: request.remaining.as_millis() as u64,
            event: request.event,
            context: request.context,
            env: self.config.environment.clone(),
        });
        let events = self.config.topics.events();
        if let Err(e) = self.bridge.publish(&events, &invocation, Echo::Suppress).await {
            lock(&self.waiters).remove(&request.request_id);
            return Err(e.into());
        }
        debug!(request_id = %request.request_id, "Invocation forwarded");

        match tokio::time::timeout(request.remaining, rx).await {
            Ok(Ok(Reply::Success(body))) => Ok(body),
            Ok(Ok(Reply::Error {
                error_type,
                error_message,
                trace,
            })) => Err(StubError::Handler {
                error_type,
                error_message,
                trace,
            }),
            Ok(Err(_)) => Err(StubError::Closed),
            Err(_) => {
                lock(&self.waiters).remove(&request.request_id);
                warn!(request_id = %request.request_id, "Timed out waiting for the local worker");
                let timeout = Event::FunctionTimeout(FunctionTimeout {
                    worker_id: self.config.worker_id.clone(),
                    function_id: self.config.function_id.clone(),
                    request_id: request.request_id,
                });
                if let Err(e) = self.bridge.publish(&events, &timeout, Echo::Suppress).await {
                    warn!(error = %e, "Failed to publish timeout");
                }
                Err(StubError::Timeout(request.remaining))
            }
        }
    }
}

impl Drop for Stub {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn lock(waiters: &Waiters) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn dispatch(
    mut decoded: mpsc::UnboundedReceiver<Inbound>,
    worker_id: String,
    waiters: Waiters,
) {
    while let Some(inbound) = decoded.recv().await {
        let event = match Event::from_envelope(&inbound.envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(kind = %inbound.envelope.kind, error = %e, "Dropping unrecognised reply");
                continue;
            }
        };
        let (request_id, reply) = match event {
            Event::FunctionSuccess(success) if success.worker_id == worker_id => {
                (success.request_id, Reply::Success(success.body))
            }
            Event::FunctionError(error) if error.worker_id == worker_id => (
                error.request_id,
                Reply::Error {
                    error_type: error.error_type,
                    error_message: error.error_message,
                    trace: error.trace,
                },
            ),
            Event::FunctionAck(ack) => {
                debug!(request_id = %ack.request_id, "Invocation acknowledged");
                continue;
            }
            _ => continue,
        };
        match lock(&waiters).remove(&request_id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(request_id = %request_id, "Reply for unknown request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some("1"), true)]
    #[case(Some("true"), true)]
    #[case(Some("TRUE "), true)]
    #[case(Some("0"), false)]
    #[case(Some("yes"), false)]
    #[case(None, false)]
    fn live_mode_switch(#[case] value: Option<&str>, #[case] expected: bool) {
        assert_eq!(enabled(value), expected);
    }

    #[test]
    fn reserved_variables_are_not_forwarded() {
        let vars = [
            ("DATABASE_URL", "postgres://db"),
            ("AWS_LAMBDA_RUNTIME_API", "127.0.0.1:9001"),
            ("_HANDLER", "bootstrap"),
            ("AWS_REGION", "eu-west-1"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string()));

        let env = forwarded_environment(vars);

        assert_eq!(env.len(), 2);
        assert_eq!(env["DATABASE_URL"], "postgres://db");
        assert_eq!(env["AWS_REGION"], "eu-west-1");
    }

    #[test]
    fn every_instance_gets_its_own_reply_address() {
        let topics = Topics::new("todos", "dev");
        let a = StubConfig::new(topics.clone(), "api");
        let b = StubConfig::new(topics, "api");
        assert_ne!(a.worker_id, b.worker_id);
    }
}
