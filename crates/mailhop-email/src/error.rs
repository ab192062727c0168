use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("storage error: {0}")]
    Storage(#[from] mailhop_storage::StorageError),
    #[error("queue error: {0}")]
    Queue(#[from] mailhop_queue::QueueError),
    #[error("security error: {0}")]
    Security(#[from] mailhop_security::SecurityError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mail parse error: {0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("imap error: {0}")]
    Imap(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("smtp transport error: {0}")]
    Smtp(String),
    #[error("message build error: {0}")]
    Build(String),
    #[error("account {0} not found")]
    AccountNotFound(uuid::Uuid),
    /// Account setup problems that retrying will not fix.
    #[error("{0}")]
    Config(String),
    #[error("invalid data: {0}")]
    Data(String),
}

impl EmailError {
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
