use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lambda_live_proto::{Event, EventKind, FunctionAck, Invocation, WorkerOutput, WorkerRef};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::WorkerError;
use super::builder::Builder;
use super::handler::{
    BuildArtifact, RuntimeHandler, RuntimeHandlers, StartWorkerInput, WorkerEvent,
};
use crate::bus::{EventBus, EventSubscription};
use crate::config::FunctionConfig;
use crate::runtime::InvocationQueue;

#[derive(Debug, Clone)]
pub struct WorkerManagerConfig {
    /// `host:port` of the runtime API emulator.
    pub runtime_api: String,
    /// Attach mode: workers are registered but never built or spawned.
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub function_id: String,
    pub last_request_id: Option<String>,
}

enum ManagerCmd {
    Describe {
        worker_id: String,
        reply: oneshot::Sender<Option<WorkerInfo>>,
    },
    List {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum WorkerState {
    /// Waiting for the artifact and the process. Invocations that arrive
    /// meanwhile are held here. `exited` records a process that died before
    /// its start was processed.
    Starting {
        pending: Vec<Invocation>,
        exited: Option<Option<i32>>,
    },
    Running,
    Attached,
}

struct Worker {
    function_id: String,
    instance: u64,
    last_request_id: Option<String>,
    environment: HashMap<String, String>,
    handler: Option<Arc<dyn RuntimeHandler>>,
    state: WorkerState,
}

impl Worker {
    fn info(&self, worker_id: &str) -> WorkerInfo {
        WorkerInfo {
            worker_id: worker_id.to_string(),
            function_id: self.function_id.clone(),
            last_request_id: self.last_request_id.clone(),
        }
    }
}

struct StartOutcome {
    worker_id: String,
    instance: u64,
    result: Result<Arc<BuildArtifact>, WorkerError>,
}

struct WorkerManager {
    bus: EventBus,
    builder: Builder,
    handlers: RuntimeHandlers,
    functions: Arc<BTreeMap<String, FunctionConfig>>,
    queue: InvocationQueue,
    config: WorkerManagerConfig,
    workers: HashMap<String, Worker>,
    next_instance: u64,
    worker_events: mpsc::UnboundedSender<WorkerEvent>,
    started: mpsc::UnboundedSender<StartOutcome>,
}

/// Spawns the worker lifecycle actor.
///
/// The actor subscribes to the bus before this returns, so no invocation
/// published afterwards is missed.
pub fn spawn_worker_manager(
    bus: EventBus,
    builder: Builder,
    handlers: RuntimeHandlers,
    functions: Arc<BTreeMap<String, FunctionConfig>>,
    queue: InvocationQueue,
    config: WorkerManagerConfig,
) -> (WorkerManagerHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let (started_tx, started_rx) = mpsc::unbounded_channel();
    let events = bus.subscribe_channel(&[EventKind::FunctionInvoked, EventKind::BuildSucceeded]);

    let manager = WorkerManager {
        bus,
        builder,
        handlers,
        functions,
        queue,
        config,
        workers: HashMap::new(),
        next_instance: 0,
        worker_events: worker_tx,
        started: started_tx,
    };
    let task = tokio::spawn(manager.run(cmd_rx, events, worker_rx, started_rx));
    (WorkerManagerHandle { tx: cmd_tx }, task)
}

impl WorkerManager {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ManagerCmd>,
        mut events: EventSubscription,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
        mut started_rx: mpsc::UnboundedReceiver<StartOutcome>,
    ) {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => match cmd {
                    ManagerCmd::Describe { worker_id, reply } => {
                        let info = self.workers.get(&worker_id).map(|w| w.info(&worker_id));
                        let _ = reply.send(info);
                    }
                    ManagerCmd::List { reply } => {
                        let mut workers: Vec<WorkerInfo> = self
                            .workers
                            .iter()
                            .map(|(id, w)| w.info(id))
                            .collect();
                        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
                        let _ = reply.send(workers);
                    }
                    ManagerCmd::Shutdown { reply } => {
                        self.stop_all().await;
                        let _ = reply.send(());
                        break;
                    }
                },
                Some(event) = events.recv() => match event {
                    Event::FunctionInvoked(invocation) => self.on_invoked(invocation),
                    Event::BuildSucceeded(built) => self.on_rebuilt(&built.function_id).await,
                    _ => {}
                },
                Some(event) = worker_rx.recv() => self.on_worker_event(event),
                Some(outcome) = started_rx.recv() => self.on_started(outcome).await,
                else => break,
            }
        }

        info!("Worker manager stopped");
    }

    fn on_invoked(&mut self, invocation: Invocation) {
        self.bus.publish(&Event::FunctionAck(FunctionAck {
            worker_id: invocation.worker_id.clone(),
            function_id: invocation.function_id.clone(),
            request_id: invocation.request_id.clone(),
        }));

        if let Some(worker) = self.workers.get_mut(&invocation.worker_id) {
            worker.last_request_id = Some(invocation.request_id.clone());
            match &mut worker.state {
                WorkerState::Starting { pending, .. } => pending.push(invocation),
                WorkerState::Running | WorkerState::Attached => self.queue.deliver(invocation),
            }
            return;
        }

        let worker_id = invocation.worker_id.clone();
        let function_id = invocation.function_id.clone();

        if self.config.debug {
            info!(worker_id = %worker_id, function_id = %function_id, "Attaching worker");
            self.workers.insert(
                worker_id.clone(),
                Worker {
                    function_id: function_id.clone(),
                    instance: 0,
                    last_request_id: Some(invocation.request_id.clone()),
                    environment: HashMap::new(),
                    handler: None,
                    state: WorkerState::Attached,
                },
            );
            self.queue.deliver(invocation);
            self.bus.publish(&Event::WorkerStarted(WorkerRef {
                worker_id,
                function_id,
            }));
            return;
        }

        let Some(function) = self.functions.get(&function_id) else {
            warn!(worker_id = %worker_id, function_id = %function_id, "Invocation for unknown function dropped");
            return;
        };
        let handler = match self.handlers.for_runtime(&function.runtime) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(function_id = %function_id, error = %e, "Invocation dropped");
                return;
            }
        };

        let mut environment = invocation.env.clone();
        environment.extend(
            function
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let instance = self.next_instance();
        self.workers.insert(
            worker_id.clone(),
            Worker {
                function_id: function_id.clone(),
                instance,
                last_request_id: Some(invocation.request_id.clone()),
                environment,
                handler: Some(handler),
                state: WorkerState::Starting {
                    pending: vec![invocation],
                    exited: None,
                },
            },
        );
        self.start(&worker_id);
    }

    fn next_instance(&mut self) -> u64 {
        self.next_instance += 1;
        self.next_instance
    }

    /// Builds (or reuses) the artifact and starts the process in the
    /// background; the outcome comes back through `started`.
    fn start(&self, worker_id: &str) {
        let Some(worker) = self.workers.get(worker_id) else {
            return;
        };
        let Some(handler) = worker.handler.clone() else {
            return;
        };
        let runtime = self
            .functions
            .get(&worker.function_id)
            .map(|f| f.runtime.clone())
            .unwrap_or_default();

        let builder = self.builder.clone();
        let events = self.worker_events.clone();
        let started = self.started.clone();
        let worker_id = worker_id.to_string();
        let function_id = worker.function_id.clone();
        let instance = worker.instance;
        let environment = worker.environment.clone();
        let runtime_api = format!("{}/{}", self.config.runtime_api, worker_id);

        debug!(worker_id = %worker_id, function_id = %function_id, instance, "Starting worker");
        tokio::spawn(async move {
            let result = async {
                let artifact = builder.artifact(&function_id).await?;
                handler
                    .start_worker(
                        StartWorkerInput {
                            worker_id: worker_id.clone(),
                            function_id,
                            instance,
                            runtime,
                            artifact: artifact.clone(),
                            environment,
                            runtime_api,
                        },
                        events,
                    )
                    .await?;
                Ok::<_, WorkerError>(artifact)
            }
            .await;
            let _ = started.send(StartOutcome {
                worker_id,
                instance,
                result,
            });
        });
    }

    async fn on_started(&mut self, outcome: StartOutcome) {
        let StartOutcome {
            worker_id,
            instance,
            result,
        } = outcome;
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if worker.instance != instance {
            return;
        }

        let artifact = match result {
            Ok(artifact) => artifact,
            Err(e) => {
                // Held invocations are dropped; the caller times out.
                warn!(worker_id = %worker_id, function_id = %worker.function_id, error = %e, "Worker failed to start");
                self.workers.remove(&worker_id);
                return;
            }
        };

        let current = self.builder.cached(&worker.function_id);
        if !current.is_some_and(|current| Arc::ptr_eq(&current, &artifact)) {
            debug!(worker_id = %worker_id, "Artifact replaced while starting, restarting");
            if let Some(handler) = &worker.handler {
                handler.stop_worker(&worker_id).await;
            }
            self.next_instance += 1;
            worker.instance = self.next_instance;
            if let WorkerState::Starting { exited, .. } = &mut worker.state {
                *exited = None;
            }
            self.start(&worker_id);
            return;
        }

        let (pending, exited) = match std::mem::replace(&mut worker.state, WorkerState::Running) {
            WorkerState::Starting { pending, exited } => (pending, exited),
            WorkerState::Running | WorkerState::Attached => (Vec::new(), None),
        };
        if let Some(code) = exited {
            // Held invocations are dropped; the caller times out.
            warn!(
                worker_id = %worker_id,
                function_id = %worker.function_id,
                dropped = pending.len(),
                "Worker exited before it started"
            );
            self.remove_exited(&worker_id, code);
            return;
        }
        for invocation in pending {
            self.queue.deliver(invocation);
        }
        info!(worker_id = %worker_id, function_id = %worker.function_id, "Worker started");
        self.bus.publish(&Event::WorkerStarted(WorkerRef {
            worker_id: worker_id.clone(),
            function_id: worker.function_id.clone(),
        }));
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Output {
                worker_id,
                function_id,
                line,
            } => {
                let message = line.trim();
                if message.is_empty() {
                    return;
                }
                let request_id = self
                    .workers
                    .get(&worker_id)
                    .and_then(|w| w.last_request_id.clone());
                self.bus.publish(&Event::WorkerStdout(WorkerOutput {
                    worker_id,
                    function_id,
                    request_id,
                    message: message.to_string(),
                }));
            }
            WorkerEvent::Exited {
                worker_id,
                instance,
                code,
            } => {
                let Some(worker) = self.workers.get_mut(&worker_id) else {
                    return;
                };
                if worker.instance != instance {
                    return;
                }
                let running = match &mut worker.state {
                    WorkerState::Starting { exited, .. } => {
                        debug!(worker_id = %worker_id, code = ?code, "Worker exited while starting");
                        *exited = Some(code);
                        false
                    }
                    WorkerState::Running => true,
                    WorkerState::Attached => false,
                };
                if running {
                    self.remove_exited(&worker_id, code);
                }
            }
        }
    }

    fn remove_exited(&mut self, worker_id: &str, code: Option<i32>) {
        let Some(worker) = self.workers.remove(worker_id) else {
            return;
        };
        self.queue.remove_waiter(worker_id);
        info!(worker_id = %worker_id, function_id = %worker.function_id, code = ?code, "Worker exited");
        self.bus.publish(&Event::WorkerExited(WorkerRef {
            worker_id: worker_id.to_string(),
            function_id: worker.function_id,
        }));
    }

    /// Stops running workers of a rebuilt function so their next invocation
    /// starts against the new artifact.
    async fn on_rebuilt(&mut self, function_id: &str) {
        if self.config.debug {
            return;
        }
        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.function_id == function_id && matches!(w.state, WorkerState::Running))
            .map(|(id, _)| id.clone())
            .collect();

        for worker_id in stale {
            let Some(worker) = self.workers.remove(&worker_id) else {
                continue;
            };
            self.queue.remove_waiter(&worker_id);
            if let Some(handler) = &worker.handler {
                handler.stop_worker(&worker_id).await;
            }
            info!(worker_id = %worker_id, function_id = %function_id, "Worker stopped after rebuild");
            self.bus.publish(&Event::WorkerStopped(WorkerRef {
                worker_id,
                function_id: function_id.to_string(),
            }));
        }
    }

    async fn stop_all(&mut self) {
        for (worker_id, worker) in self.workers.drain() {
            if let Some(handler) = &worker.handler {
                handler.stop_worker(&worker_id).await;
            }
            self.queue.remove_waiter(&worker_id);
        }
    }
}

#[derive(Clone)]
pub struct WorkerManagerHandle {
    tx: mpsc::Sender<ManagerCmd>,
}

impl WorkerManagerHandle {
    pub async fn describe(&self, worker_id: &str) -> Result<Option<WorkerInfo>, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManagerCmd::Describe {
                worker_id: worker_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)
    }

    pub async fn list(&self) -> Result<Vec<WorkerInfo>, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManagerCmd::List { reply: reply_tx })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)
    }

    /// Stops every worker process and ends the actor.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManagerCmd::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)
    }
}
