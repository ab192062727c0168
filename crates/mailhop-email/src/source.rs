use crate::EmailError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailhop_core::Account;
use std::collections::HashSet;

/// Where a raw message came from inside its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOrigin {
    Imap { uid: u32 },
    Gmail { gmail_id: String, thread_id: Option<String> },
}

/// Undecoded RFC 822 bytes plus the identifier used for deduplication.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub provider_message_id: String,
    pub origin: MessageOrigin,
    pub raw: Vec<u8>,
}

/// Mailbox reachable only by asking for its unseen messages.
#[async_trait]
pub trait UnseenSource: Send + Sync {
    /// Unseen messages other than those in `stored_uids`, whose bodies are
    /// never downloaded.
    async fn fetch_unseen(
        &self,
        account: &Account,
        stored_uids: &HashSet<u32>,
    ) -> Result<Vec<RawMessage>, EmailError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchRegistration {
    pub history_id: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub history_id: u64,
    pub message_ids: Vec<String>,
}

/// Mailbox that announces changes through a push subscription and exposes a
/// monotonically increasing history cursor. One instance serves one account.
#[async_trait]
pub trait PushMailbox: Send + Sync {
    async fn register_watch(&self) -> Result<WatchRegistration, EmailError>;

    /// Provider ids of unread inbox messages.
    async fn list_unread(&self) -> Result<Vec<String>, EmailError>;

    /// Inbox additions recorded after `start_history_id`, oldest first.
    async fn history_since(&self, start_history_id: u64) -> Result<Vec<HistoryRecord>, EmailError>;

    async fn fetch_message(&self, provider_id: &str) -> Result<RawMessage, EmailError>;
}
