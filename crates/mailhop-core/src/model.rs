use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Mailbox provider tag persisted on every account.
///
/// `Imap` accounts are fetched by polling, `Gmail` accounts by push
/// notifications plus history replay. Tags this build does not know are kept
/// verbatim so the fetch manager can report them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    Imap,
    Gmail,
    Unsupported(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Imap => "imap",
            Self::Gmail => "gmail",
            Self::Unsupported(tag) => tag,
        }
    }
}

impl From<String> for Provider {
    fn from(value: String) -> Self {
        match value.as_str() {
            "imap" => Self::Imap,
            "gmail" => Self::Gmail,
            _ => Self::Unsupported(value),
        }
    }
}

impl From<&str> for Provider {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Provider> for String {
    fn from(value: Provider) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Base64 AES-GCM ciphertext, never the plain password.
    pub password_encrypted: String,
}

impl ServerCredentials {
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty()
            && self.port != 0
            && !self.username.trim().is_empty()
            && !self.password_encrypted.is_empty()
    }
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password_encrypted", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("access_token_encrypted", &"[REDACTED]")
            .field(
                "refresh_token_encrypted",
                &self.refresh_token_encrypted.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCredentials {
    #[serde(default)]
    pub imap: Option<ServerCredentials>,
    #[serde(default)]
    pub smtp: Option<ServerCredentials>,
    #[serde(default)]
    pub oauth: Option<OAuthCredentials>,
}

/// Incremental-sync position of a push account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushCursor {
    pub history_id: Option<u64>,
    pub watch_expires_at: Option<DateTime<Utc>>,
}

impl PushCursor {
    /// True while a registered watch is known and has not expired.
    pub fn watch_is_current(&self, now: DateTime<Utc>) -> bool {
        matches!(self.watch_expires_at, Some(expires_at) if expires_at > now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    pub email_address: String,
    pub display_name: Option<String>,
    pub credentials: AccountCredentials,
    pub cursor: PushCursor,
    pub is_active: bool,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(user_id: Uuid, provider: Provider, email_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            provider,
            email_address: email_address.into(),
            display_name: None,
            credentials: AccountCredentials::default(),
            cursor: PushCursor::default(),
            is_active: true,
            last_fetch_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub path: String,
}

/// Structured facts pulled out of a message by the summarizer.
///
/// Every category is optional; a missing or malformed category is simply
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedData {
    #[serde(default)]
    pub verification_codes: Vec<String>,
    #[serde(default)]
    pub amounts: Vec<String>,
    #[serde(default)]
    pub due_dates: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub tracking_numbers: Vec<String>,
}

impl ExtractedData {
    /// Builds the typed view from whatever JSON the summarizer produced.
    ///
    /// Arrays keep their string (and numeric) members in order, a bare string
    /// counts as a one-element list, everything else is ignored.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        let category = |key: &str| -> Vec<String> {
            match object.get(key) {
                Some(serde_json::Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
                Some(other) => scalar_text(other).into_iter().collect(),
                None => Vec::new(),
            }
        };

        Self {
            verification_codes: category("verification_codes"),
            amounts: category("amounts"),
            due_dates: category("due_dates"),
            action_items: category("action_items"),
            tracking_numbers: category("tracking_numbers"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.verification_codes.is_empty()
            && self.amounts.is_empty()
            && self.due_dates.is_empty()
            && self.action_items.is_empty()
            && self.tracking_numbers.is_empty()
    }
}

fn scalar_text(value: &serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::String(text) => text.trim().to_string(),
        serde_json::Value::Number(number) => number.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    #[serde(default)]
    pub extracted_data: ExtractedData,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// AI enrichment columns of a stored message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryFields {
    pub summary: Option<String>,
    pub extracted: Option<ExtractedData>,
    pub model: Option<String>,
    pub summarized_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SummaryFields {
    pub fn from_result(result: &SummaryResult, at: DateTime<Utc>) -> Self {
        Self {
            summary: Some(result.summary.clone()),
            extracted: Some(result.extracted_data.clone()),
            model: Some(result.model.clone()),
            summarized_at: Some(at),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn has_summary(&self) -> bool {
        self.summary
            .as_deref()
            .is_some_and(|summary| !summary.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Dedup key within the account.
    pub provider_message_id: String,
    pub message_id_header: Option<String>,
    pub thread_id: Option<String>,
    pub gmail_id: Option<String>,
    pub imap_uid: Option<u32>,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub subject: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub sanitized_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub attachments: Vec<AttachmentRecord>,
    pub is_read: bool,
    pub is_notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub summary: SummaryFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Hand-off record between ingestion and notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub email_id: Uuid,
    pub account_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub chat_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewToken {
    pub id: Uuid,
    pub email_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub view_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentReply {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_email_id: Option<Uuid>,
    pub account_id: Uuid,
    pub to_address: String,
    pub subject: String,
    pub body: String,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}
