use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] mailhop_storage::StorageError),
    #[error("event encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid event payload {payload:?}: {source}")]
    InvalidPayload {
        payload: String,
        source: serde_json::Error,
    },
}
