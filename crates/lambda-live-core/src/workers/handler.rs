use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::WorkerError;
use super::process::ProcessHandler;
use crate::config::FunctionConfig;

#[derive(Debug, Clone)]
pub struct BuildInput {
    pub function_id: String,
    pub function: FunctionConfig,
    /// Fresh, empty output directory for this build.
    pub out: PathBuf,
    /// Service root that handler paths are relative to.
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutput {
    Success {
        handler: String,
        sourcemap: Option<PathBuf>,
    },
    Error {
        errors: Vec<String>,
    },
}

/// The current build of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub out: PathBuf,
    pub handler: String,
    pub sourcemap: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StartWorkerInput {
    pub worker_id: String,
    pub function_id: String,
    /// Distinguishes successive processes started for the same worker id.
    pub instance: u64,
    pub runtime: String,
    pub artifact: Arc<BuildArtifact>,
    pub environment: HashMap<String, String>,
    /// Value for `AWS_LAMBDA_RUNTIME_API`, already scoped to the worker.
    pub runtime_api: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ShouldBuildInput<'a> {
    pub function_id: &'a str,
    pub file: &'a Path,
}

/// Reported by a handler about the processes it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Output {
        worker_id: String,
        function_id: String,
        line: String,
    },
    Exited {
        worker_id: String,
        instance: u64,
        code: Option<i32>,
    },
}

/// Builds and runs functions of one family of runtimes.
#[async_trait]
pub trait RuntimeHandler: Send + Sync + 'static {
    fn can_handle(&self, runtime: &str) -> bool;

    async fn build(&self, input: BuildInput) -> BuildOutput;

    /// Starts a worker process. Output lines and the eventual exit are
    /// reported through `events`.
    async fn start_worker(
        &self,
        input: StartWorkerInput,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<(), WorkerError>;

    async fn stop_worker(&self, worker_id: &str);

    /// Whether a change to `file` makes the function's artifact stale.
    fn should_build(&self, input: &ShouldBuildInput<'_>) -> bool;
}

#[derive(Clone, Default)]
pub struct RuntimeHandlers {
    handlers: Vec<Arc<dyn RuntimeHandler>>,
}

impl RuntimeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut handlers = Self::new();
        handlers.register(Arc::new(ProcessHandler::new()));
        handlers
    }

    pub fn register(&mut self, handler: Arc<dyn RuntimeHandler>) {
        self.handlers.push(handler);
    }

    pub fn for_runtime(&self, runtime: &str) -> Result<Arc<dyn RuntimeHandler>, WorkerError> {
        self.handlers
            .iter()
            .find(|h| h.can_handle(runtime))
            .cloned()
            .ok_or_else(|| WorkerError::UnsupportedRuntime(runtime.to_string()))
    }
}
