use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("storage error: {0}")]
    Storage(#[from] mailhop_storage::StorageError),
    #[error("chat error: {0}")]
    Chat(#[from] mailhop_notify::NotifyError),
    #[error("email error: {0}")]
    Email(#[from] mailhop_email::EmailError),
    #[error("security error: {0}")]
    Security(#[from] mailhop_security::SecurityError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid data: {0}")]
    Data(String),
}
