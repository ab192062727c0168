use crate::{ChatSender, NotificationFormatter, NotifyError};
use async_trait::async_trait;
use chrono::Utc;
use mailhop_ai::{AiError, Summarizer};
use mailhop_core::{MailMessage, QueueEvent, SummaryFields, SummaryResult};
use mailhop_queue::EventHandler;
use mailhop_storage::{KvStore, Storage};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn summary_cache_key(email_id: Uuid) -> String {
    format!("llm:summary:{email_id}")
}

struct Enrichment {
    summarizer: Arc<dyn Summarizer>,
    timeout: Duration,
    cache_ttl: Duration,
}

/// Turns queue events into chat notifications, optionally enriched with a
/// cached AI summary.
pub struct NotificationConsumer {
    storage: Storage,
    kv: KvStore,
    sender: Arc<dyn ChatSender>,
    formatter: NotificationFormatter,
    enrichment: Option<Enrichment>,
}

impl NotificationConsumer {
    pub fn new(storage: Storage, kv: KvStore, sender: Arc<dyn ChatSender>) -> Self {
        Self {
            storage,
            kv,
            sender,
            formatter: NotificationFormatter::new(),
            enrichment: None,
        }
    }

    /// Enables summaries. Each call is bounded by `timeout`; results are
    /// cached for `cache_ttl`.
    pub fn with_summarizer(
        mut self,
        summarizer: Arc<dyn Summarizer>,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> Self {
        self.enrichment = Some(Enrichment {
            summarizer,
            timeout,
            cache_ttl,
        });
        self
    }

    /// Delivers one notification. On success the message is marked
    /// notified; a failed delivery leaves it unmarked and returns the error.
    pub async fn notify(&self, event: QueueEvent) -> Result<(), NotifyError> {
        let mut message = self
            .storage
            .get_message(event.email_id)
            .await?
            .ok_or(NotifyError::MessageNotFound(event.email_id))?;
        let user = self
            .storage
            .get_user(event.user_id)
            .await?
            .ok_or(NotifyError::UserNotFound(event.user_id))?;

        if let Some(enrichment) = &self.enrichment {
            if !message.summary.has_summary() {
                message.summary = self.enrich(enrichment, &message).await?;
            }
        }

        let notification = self.formatter.format(&message);
        if let Err(err) = self.sender.send_message(user.chat_id, &notification).await {
            tracing::error!(
                email_id = %message.id,
                user_id = %user.id,
                "notification delivery failed: {err}"
            );
            return Err(err);
        }

        self.storage.mark_message_notified(message.id).await?;
        tracing::info!(email_id = %message.id, user_id = %user.id, "notification sent");
        Ok(())
    }

    /// Cache-aside summary lookup. A failed or slow summarizer degrades to
    /// empty summary fields carrying the error text.
    async fn enrich(
        &self,
        enrichment: &Enrichment,
        message: &MailMessage,
    ) -> Result<SummaryFields, NotifyError> {
        let key = summary_cache_key(message.id);

        match self.kv.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<SummaryResult>(&cached) {
                Ok(result) => {
                    tracing::debug!(email_id = %message.id, "summary cache hit");
                    return Ok(SummaryFields::from_result(&result, Utc::now()));
                }
                Err(err) => {
                    tracing::warn!(email_id = %message.id, "ignoring unreadable cached summary: {err}");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(email_id = %message.id, "summary cache read failed: {err}");
            }
        }

        let outcome = tokio::time::timeout(
            enrichment.timeout,
            enrichment.summarizer.summarize(message),
        )
        .await
        .unwrap_or_else(|_| Err(AiError::Timeout));

        match outcome {
            Ok(result) => {
                let fields = SummaryFields::from_result(&result, Utc::now());
                self.storage.update_message_summary(message.id, &fields).await?;

                let payload = serde_json::to_string(&result)?;
                if let Err(err) = self
                    .kv
                    .set(&key, &payload, Some(enrichment.cache_ttl))
                    .await
                {
                    tracing::warn!(email_id = %message.id, "summary cache write failed: {err}");
                }
                Ok(fields)
            }
            Err(err) => {
                tracing::warn!(
                    email_id = %message.id,
                    model = %enrichment.summarizer.model(),
                    "summarization failed, falling back to preview: {err}"
                );
                let fields = SummaryFields::failed(err.to_string());
                self.storage.update_message_summary(message.id, &fields).await?;
                Ok(fields)
            }
        }
    }
}

#[async_trait]
impl EventHandler for NotificationConsumer {
    type Error = NotifyError;

    async fn handle(&self, event: QueueEvent) -> Result<(), Self::Error> {
        self.notify(event).await
    }
}
