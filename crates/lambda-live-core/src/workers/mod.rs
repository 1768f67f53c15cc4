//! Building artifacts and supervising the local processes that serve remote
//! invocations.

pub mod builder;
pub mod handler;
pub mod manager;
pub mod process;

use thiserror::Error;

pub use builder::{BuildFailure, Builder};
pub use handler::{
    BuildArtifact, BuildInput, BuildOutput, RuntimeHandler, RuntimeHandlers, ShouldBuildInput,
    StartWorkerInput, WorkerEvent,
};
pub use manager::{WorkerInfo, WorkerManagerConfig, WorkerManagerHandle, spawn_worker_manager};
pub use process::ProcessHandler;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Function with ID \"{0}\" not found")]
    UnknownFunction(String),

    #[error("{0} runtime is unsupported")]
    UnsupportedRuntime(String),

    #[error(transparent)]
    Build(#[from] BuildFailure),

    #[error("Failed to start worker {worker_id}: {source}")]
    Spawn {
        worker_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker manager channel closed")]
    ChannelClosed,
}
