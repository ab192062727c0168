use crate::gmail::value_to_u64;
use crate::{EmailError, FetchManager};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PUBSUB_API_BASE: &str = "https://pubsub.googleapis.com/v1";
const MAX_MESSAGES: u32 = 10;

/// Decoded Gmail push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushNotification {
    pub email_address: String,
    pub history_id: u64,
}

/// Parses the base64 `data` field of a Pub/Sub message.
pub fn parse_push_payload(data: &str) -> Result<PushNotification, EmailError> {
    let bytes = STANDARD
        .decode(data.trim().as_bytes())
        .or_else(|_| URL_SAFE.decode(data.trim().as_bytes()))
        .map_err(|err| EmailError::Data(format!("push payload is not base64: {err}")))?;

    let payload: PushPayload = serde_json::from_slice(&bytes)
        .map_err(|err| EmailError::Data(format!("push payload is not JSON: {err}")))?;
    let history_id = value_to_u64(&payload.history_id)
        .ok_or_else(|| EmailError::Data("push payload has no historyId".to_string()))?;
    if payload.email_address.trim().is_empty() {
        return Err(EmailError::Data("push payload has no emailAddress".to_string()));
    }

    Ok(PushNotification {
        email_address: payload.email_address,
        history_id,
    })
}

/// Pull-mode subscriber that feeds Gmail notifications to the fetch manager.
pub struct PubSubListener {
    http: reqwest::Client,
    api_base: String,
    subscription: String,
    token: String,
    manager: Arc<FetchManager>,
    pull_interval: Duration,
}

impl PubSubListener {
    /// `subscription` is the full `projects/<p>/subscriptions/<s>` name.
    pub fn new(
        manager: Arc<FetchManager>,
        subscription: impl Into<String>,
        token: impl Into<String>,
        pull_interval: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: PUBSUB_API_BASE.to_string(),
            subscription: subscription.into(),
            token: token.into(),
            manager,
            pull_interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(subscription = %self.subscription, "push listener started");

        while !cancel.is_cancelled() {
            let delivered = match self.pull_once().await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(subscription = %self.subscription, "pull failed: {err}");
                    0
                }
            };

            if delivered == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.pull_interval) => {}
                }
            }
        }

        tracing::info!(subscription = %self.subscription, "push listener stopped");
    }

    /// Pulls one batch, dispatches every message and acknowledges the batch.
    /// Messages that cannot be decoded or dispatched are acknowledged too;
    /// the next notification for the account replays the same history.
    pub async fn pull_once(&self) -> Result<usize, EmailError> {
        let response = self
            .http
            .post(format!("{}/{}:pull", self.base(), self.subscription))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "maxMessages": MAX_MESSAGES }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmailError::Provider(format!(
                "Pub/Sub pull failed with status {}",
                response.status()
            )));
        }

        let payload: PullResponse = response.json().await?;
        let mut ack_ids = Vec::with_capacity(payload.received_messages.len());
        for received in payload.received_messages {
            ack_ids.push(received.ack_id);
            let data = received.message.data.unwrap_or_default();

            match parse_push_payload(&data) {
                Ok(notification) => {
                    tracing::debug!(
                        email = %notification.email_address,
                        history_id = notification.history_id,
                        "push notification received"
                    );
                    if let Err(err) = self
                        .manager
                        .dispatch_push(&notification.email_address, notification.history_id)
                        .await
                    {
                        tracing::warn!(email = %notification.email_address, "push dispatch failed: {err}");
                    }
                }
                Err(err) => tracing::warn!("dropping push message: {err}"),
            }
        }

        if !ack_ids.is_empty() {
            self.acknowledge(&ack_ids).await?;
        }
        Ok(ack_ids.len())
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), EmailError> {
        let response = self
            .http
            .post(format!("{}/{}:acknowledge", self.base(), self.subscription))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "ackIds": ack_ids }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmailError::Provider(format!(
                "Pub/Sub acknowledge failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn base(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushPayload {
    #[serde(default)]
    email_address: String,
    #[serde(default)]
    history_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
    data: Option<String>,
}
