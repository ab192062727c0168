use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("storage error: {0}")]
    Storage(#[from] mailhop_storage::StorageError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("telegram error: {0}")]
    Telegram(String),
    #[error("message {0} not found")]
    MessageNotFound(Uuid),
    #[error("user {0} not found")]
    UserNotFound(Uuid),
}
