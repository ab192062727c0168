use crate::{
    message_id_from_raw, EmailError, HistoryRecord, MessageOrigin, PushMailbox, RawMessage,
    WatchRegistration,
};
use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mailhop_core::Account;
use mailhop_security::{CredentialCipher, OAuthRefresher};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const UNREAD_QUERY: &str = "is:unread in:inbox";
const UNREAD_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone)]
pub struct GmailSettings {
    pub api_base: String,
    /// Fully qualified `projects/<project>/topics/<topic>`.
    pub topic_name: String,
}

struct AccessToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Gmail REST client for one account, refreshing its bearer token on demand.
pub struct GmailMailbox {
    http: reqwest::Client,
    settings: GmailSettings,
    token: Mutex<AccessToken>,
    refresh_token: Option<String>,
    refresher: Option<OAuthRefresher>,
}

impl GmailMailbox {
    pub fn new(
        account: &Account,
        cipher: &CredentialCipher,
        settings: GmailSettings,
        refresher: Option<OAuthRefresher>,
        http: reqwest::Client,
    ) -> Result<Self, EmailError> {
        let oauth = account
            .credentials
            .oauth
            .as_ref()
            .ok_or_else(|| EmailError::Config("Gmail OAuth credentials not configured".to_string()))?;

        let refresh_token = match &oauth.refresh_token_encrypted {
            Some(encrypted) => Some(cipher.decrypt(encrypted)?),
            None => None,
        };

        Ok(Self {
            http,
            settings,
            token: Mutex::new(AccessToken {
                value: cipher.decrypt(&oauth.access_token_encrypted)?,
                expires_at: oauth.expires_at,
            }),
            refresh_token,
            refresher,
        })
    }

    async fn access_token(&self) -> Result<String, EmailError> {
        let mut token = self.token.lock().await;
        let expiring = token
            .expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now() + Duration::seconds(60));

        if expiring {
            if let (Some(refresher), Some(refresh_token)) = (&self.refresher, &self.refresh_token) {
                let refreshed = refresher.refresh(refresh_token).await?;
                token.value = refreshed.access_token;
                token.expires_at = refreshed.expires_at;
                tracing::debug!("refreshed Gmail access token");
            }
        }

        Ok(token.value.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.settings.api_base.trim_end_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        what: &str,
        url: String,
        query: &[(&str, String)],
    ) -> Result<T, EmailError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmailError::Provider(format!(
                "Gmail {what} failed with status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl PushMailbox for GmailMailbox {
    async fn register_watch(&self) -> Result<WatchRegistration, EmailError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url("watch"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "topicName": self.settings.topic_name,
                "labelIds": ["INBOX"],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmailError::Provider(format!(
                "Gmail watch failed with status {}",
                response.status()
            )));
        }

        let payload: GmailWatchResponse = response.json().await?;
        watch_registration(&payload)
    }

    async fn list_unread(&self) -> Result<Vec<String>, EmailError> {
        let payload: GmailListResponse = self
            .get_json(
                "list messages",
                self.url("messages"),
                &[
                    ("q", UNREAD_QUERY.to_string()),
                    ("maxResults", UNREAD_PAGE_SIZE.to_string()),
                ],
            )
            .await?;

        Ok(payload
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|message| message.id)
            .collect())
    }

    async fn history_since(&self, start_history_id: u64) -> Result<Vec<HistoryRecord>, EmailError> {
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("startHistoryId", start_history_id.to_string()),
                ("historyTypes", "messageAdded".to_string()),
                ("labelId", "INBOX".to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let payload: GmailHistoryResponse =
                self.get_json("history list", self.url("history"), &query).await?;
            records.extend(history_records(payload.history.unwrap_or_default()));

            match payload.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(records)
    }

    async fn fetch_message(&self, provider_id: &str) -> Result<RawMessage, EmailError> {
        let payload: GmailRawResponse = self
            .get_json(
                "get message",
                self.url(&format!("messages/{provider_id}")),
                &[("format", "raw".to_string())],
            )
            .await?;

        let raw = payload
            .raw
            .ok_or_else(|| EmailError::Data(format!("Gmail message {} has no raw payload", payload.id)))?;
        let decoded = decode_gmail_raw(&raw)?;

        Ok(RawMessage {
            provider_message_id: message_id_from_raw(&decoded).unwrap_or_else(|| payload.id.clone()),
            origin: MessageOrigin::Gmail {
                gmail_id: payload.id,
                thread_id: payload.thread_id,
            },
            raw: decoded,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailWatchResponse {
    history_id: serde_json::Value,
    #[serde(default)]
    expiration: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailListResponse {
    messages: Option<Vec<GmailMessageRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistoryResponse {
    history: Option<Vec<GmailHistory>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistory {
    id: serde_json::Value,
    #[serde(default)]
    messages_added: Vec<GmailMessageAdded>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageAdded {
    message: GmailMessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailRawResponse {
    id: String,
    thread_id: Option<String>,
    raw: Option<String>,
}

/// Gmail encodes 64-bit ids as JSON strings; Pub/Sub payloads sometimes use
/// numbers.
pub(crate) fn value_to_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(number) => number.as_u64(),
        serde_json::Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn watch_registration(payload: &GmailWatchResponse) -> Result<WatchRegistration, EmailError> {
    let history_id = value_to_u64(&payload.history_id)
        .ok_or_else(|| EmailError::Data("Gmail watch returned no historyId".to_string()))?;
    let expires_at = value_to_u64(&payload.expiration)
        .and_then(|millis| Utc.timestamp_millis_opt(millis as i64).single())
        .unwrap_or_else(|| Utc::now() + Duration::days(7));

    Ok(WatchRegistration {
        history_id,
        expires_at,
    })
}

fn history_records(history: Vec<GmailHistory>) -> Vec<HistoryRecord> {
    history
        .into_iter()
        .filter_map(|entry| {
            let history_id = value_to_u64(&entry.id)?;
            Some(HistoryRecord {
                history_id,
                message_ids: entry
                    .messages_added
                    .into_iter()
                    .map(|added| added.message.id)
                    .collect(),
            })
        })
        .collect()
}

fn decode_gmail_raw(raw: &str) -> Result<Vec<u8>, EmailError> {
    URL_SAFE_NO_PAD
        .decode(raw.as_bytes())
        .or_else(|_| URL_SAFE.decode(raw.as_bytes()))
        .map_err(|err| EmailError::Data(format!("invalid Gmail raw payload: {err}")))
}
