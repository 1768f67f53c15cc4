use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid fragment {id}: index {index} out of range for count {count}")]
    FragmentOutOfRange { id: String, index: u32, count: u32 },

    #[error("Invalid fragment {id}: count must be at least 1")]
    EmptyFragmentCount { id: String },

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Envelope properties must be a JSON object for event type {0}")]
    PropertiesNotObject(String),
}
