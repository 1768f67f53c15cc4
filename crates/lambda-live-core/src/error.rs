use lambda_live_bridge::{BridgeError, BrokerError, StorageError};
use lambda_live_proto::ProtoError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::runtime::RuntimeServerError;
use crate::workers::WorkerError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    RuntimeServer(#[from] RuntimeServerError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        Error::Bridge(err.into())
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Bridge(err.into())
    }
}
