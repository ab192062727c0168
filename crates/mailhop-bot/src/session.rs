use crate::BotError;
use mailhop_storage::KvStore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStep {
    Email,
    ImapServer,
    ImapPort,
    ImapUsername,
    ImapPassword,
}

/// Answers collected so far by an in-progress account link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSession {
    pub step: LinkStep,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub imap_server: Option<String>,
    #[serde(default)]
    pub imap_port: Option<u16>,
    #[serde(default)]
    pub imap_username: Option<String>,
}

impl LinkSession {
    pub fn new() -> Self {
        Self {
            step: LinkStep::Email,
            email: None,
            imap_server: None,
            imap_port: None,
            imap_username: None,
        }
    }
}

impl Default for LinkSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A stored link session, or one whose payload no longer decodes (for
/// example an unknown step). The latter is deleted when it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredLink {
    Active(LinkSession),
    Invalid,
}

pub fn link_session_key(chat_id: i64) -> String {
    format!("link_imap:{chat_id}")
}

pub fn reply_session_key(chat_id: i64) -> String {
    format!("reply:{chat_id}")
}

/// Per-chat conversational state kept in the shared key-value store.
///
/// Both session kinds expire a fixed time after they start. Advancing a link
/// session never extends it.
#[derive(Clone)]
pub struct SessionStore {
    kv: KvStore,
    link_ttl: Duration,
    reply_ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: KvStore, link_ttl: Duration, reply_ttl: Duration) -> Self {
        Self {
            kv,
            link_ttl,
            reply_ttl,
        }
    }

    /// Starts a fresh link session, replacing any earlier one.
    pub async fn start_link(&self, chat_id: i64) -> Result<LinkSession, BotError> {
        let session = LinkSession::new();
        let payload = serde_json::to_string(&session)?;
        self.kv
            .set(&link_session_key(chat_id), &payload, Some(self.link_ttl))
            .await?;
        Ok(session)
    }

    pub async fn link(&self, chat_id: i64) -> Result<Option<StoredLink>, BotError> {
        let Some(payload) = self.kv.get(&link_session_key(chat_id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&payload) {
            Ok(session) => Ok(Some(StoredLink::Active(session))),
            Err(err) => {
                tracing::warn!(chat_id, "rejecting unreadable link session: {err}");
                self.kv.delete(&link_session_key(chat_id)).await?;
                Ok(Some(StoredLink::Invalid))
            }
        }
    }

    /// Stores the advanced session under the original expiry. Returns false
    /// when the session expired in the meantime.
    pub async fn save_link(&self, chat_id: i64, session: &LinkSession) -> Result<bool, BotError> {
        let payload = serde_json::to_string(session)?;
        Ok(self
            .kv
            .set_keep_ttl(&link_session_key(chat_id), &payload)
            .await?)
    }

    pub async fn clear_link(&self, chat_id: i64) -> Result<bool, BotError> {
        Ok(self.kv.delete(&link_session_key(chat_id)).await?)
    }

    pub async fn start_reply(&self, chat_id: i64, email_id: Uuid) -> Result<(), BotError> {
        self.kv
            .set(
                &reply_session_key(chat_id),
                &email_id.to_string(),
                Some(self.reply_ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn reply_target(&self, chat_id: i64) -> Result<Option<Uuid>, BotError> {
        let Some(value) = self.kv.get(&reply_session_key(chat_id)).await? else {
            return Ok(None);
        };

        match Uuid::parse_str(value.trim()) {
            Ok(email_id) => Ok(Some(email_id)),
            Err(err) => {
                tracing::warn!(chat_id, "dropping unreadable reply session: {err}");
                self.clear_reply(chat_id).await?;
                Ok(None)
            }
        }
    }

    pub async fn clear_reply(&self, chat_id: i64) -> Result<bool, BotError> {
        Ok(self.kv.delete(&reply_session_key(chat_id)).await?)
    }
}
