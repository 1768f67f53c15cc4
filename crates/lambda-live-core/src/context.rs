use std::sync::Arc;

use lambda_live_bridge::{Bridge, Broker, BrokerMessage, MqttBroker, PayloadStore, new_source_id};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::error::Result;
use crate::relay::Relay;
use crate::runtime::{InvocationQueue, RuntimeServer, RuntimeServerError, RuntimeState};
use crate::watcher::FileWatcher;
use crate::workers::{
    Builder, RuntimeHandlers, WorkerManagerConfig, WorkerManagerHandle, spawn_worker_manager,
};

/// A connected broker plus the optional bulk store for oversized payloads.
pub struct Transport {
    pub broker: Arc<dyn Broker>,
    pub inbound: mpsc::UnboundedReceiver<BrokerMessage>,
    pub store: Option<PayloadStore>,
}

pub struct SessionOptions {
    pub handlers: RuntimeHandlers,
    /// Rebuild on file changes. Never enabled in debug mode.
    pub watch: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handlers: RuntimeHandlers::with_defaults(),
            watch: true,
        }
    }
}

/// Everything one developer session owns, built once at startup.
pub struct AppContext {
    config: Config,
    bus: EventBus,
    bridge: Arc<Bridge>,
    builder: Builder,
    workers: WorkerManagerHandle,
    runtime_url: String,
    cancel: CancellationToken,
    watcher: Option<FileWatcher>,
    server: JoinHandle<std::result::Result<(), RuntimeServerError>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Connects to the configured MQTT broker and starts a session.
    pub async fn start(config: Config) -> Result<Self> {
        let client_id = format!("lambda-live-{}", new_source_id());
        let (broker, inbound) = MqttBroker::connect(config.mqtt_config(&client_id)).await?;
        let store = config.payload_store()?;
        let transport = Transport {
            broker,
            inbound,
            store,
        };
        Self::start_with(config, transport, SessionOptions::default()).await
    }

    pub async fn start_with(
        config: Config,
        transport: Transport,
        options: SessionOptions,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let source_id = new_source_id();
        let bus = EventBus::new(source_id.clone());

        let bridge = Arc::new(Bridge::new(
            transport.broker,
            transport.store,
            source_id,
            config.bridge_config(),
        ));
        let (decoder, decoded) = bridge.spawn_inbound(transport.inbound);

        let server = RuntimeServer::bind(&config.runtime.host, config.runtime.port).await?;
        let runtime_url = server.url();

        let functions = Arc::new(config.functions.clone());
        let builder = Builder::new(
            bus.clone(),
            options.handlers.clone(),
            functions.clone(),
            config.root.clone(),
            config.artifacts_dir(),
            config.build.concurrency,
        );
        let queue = InvocationQueue::new();
        let (workers, manager) = spawn_worker_manager(
            bus.clone(),
            builder.clone(),
            options.handlers,
            functions,
            queue.clone(),
            WorkerManagerConfig {
                runtime_api: server.runtime_api(),
                debug: config.debug,
            },
        );

        let mut tasks = vec![decoder, manager];
        let relay = Relay::new(bus.clone(), bridge.clone(), config.topics(), config.debug);
        tasks.extend(relay.start(decoded, cancel.clone()).await?);

        let watcher = if options.watch && !config.debug {
            tasks.push(builder.watch_changes(cancel.clone()));
            Some(FileWatcher::start(&config.root, bus.clone(), cancel.clone())?)
        } else {
            None
        };

        let state = RuntimeState::new(bus.clone(), queue, Arc::new(workers.clone()));
        let server = tokio::spawn(server.serve(state, cancel.clone()));

        info!(
            service = %config.service,
            stage = %config.stage,
            runtime = %runtime_url,
            debug = config.debug,
            "Live session started"
        );

        Ok(Self {
            config,
            bus,
            bridge,
            builder,
            workers,
            runtime_url,
            cancel,
            watcher,
            server,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn builder(&self) -> &Builder {
        &self.builder
    }

    pub fn workers(&self) -> &WorkerManagerHandle {
        &self.workers
    }

    pub fn runtime_url(&self) -> &str {
        &self.runtime_url
    }

    /// Stops workers, the runtime API and every background task.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.workers.shutdown().await {
            debug!(error = %e, "Worker manager already stopped");
        }
        self.cancel.cancel();
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }

        let served = match self.server.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Runtime API task ended abnormally");
                Ok(())
            }
        };
        for task in self.tasks {
            task.abort();
        }
        info!("Live session stopped");
        Ok(served?)
    }
}
