use lambda_live_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid broker url '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Broker client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Timed out waiting for broker acknowledgment on {topic}")]
    AckTimeout { topic: String },

    #[error("Broker connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Failed to build object store: {0}")]
    Build(String),

    #[error("Gzip error: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("Pointer references bucket '{actual}' but this store serves '{expected}'")]
    ForeignBucket { expected: String, actual: String },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("Envelope of {size} bytes exceeds the inline limit and no payload store is configured")]
    StorageUnavailable { size: usize },
}
