//! Local emulation of the function runtime API that worker processes poll.

mod proxy;
pub mod queue;
pub mod server;

use thiserror::Error;

pub use queue::{InvocationQueue, Next};
pub use server::{RuntimeServer, RuntimeState, WorkerDirectory, router};

pub const API_VERSION: &str = "2018-06-01";

#[derive(Debug, Error)]
pub enum RuntimeServerError {
    #[error("Failed to bind runtime API on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Runtime API server failed: {0}")]
    Serve(#[source] std::io::Error),
}
