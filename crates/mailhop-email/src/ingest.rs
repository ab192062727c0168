use crate::{CanonicalMessage, EmailError, MessageOrigin, Normalizer, RawMessage};
use chrono::Utc;
use mailhop_core::{Account, MailMessage, QueueEvent, SummaryFields};
use mailhop_queue::EventQueue;
use mailhop_storage::{Storage, StorageError};
use std::sync::Arc;
use tokio::task;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored(Uuid),
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl IngestSummary {
    pub fn record(&mut self, outcome: &Result<IngestOutcome, EmailError>) {
        match outcome {
            Ok(IngestOutcome::Stored(_)) => self.stored += 1,
            Ok(IngestOutcome::Duplicate) => self.duplicates += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Normalize, deduplicate, persist and announce one raw message.
#[derive(Clone)]
pub struct Ingestor {
    storage: Storage,
    queue: EventQueue,
    normalizer: Arc<Normalizer>,
}

impl Ingestor {
    pub fn new(storage: Storage, queue: EventQueue, normalizer: Arc<Normalizer>) -> Self {
        Self {
            storage,
            queue,
            normalizer,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// A message already stored for the account is reported as
    /// [`IngestOutcome::Duplicate`] and produces no queue event. A failed
    /// publish is logged; the stored message stays.
    pub async fn ingest(
        &self,
        account: &Account,
        raw: RawMessage,
    ) -> Result<IngestOutcome, EmailError> {
        if self
            .storage
            .get_message_by_provider_id(account.id, &raw.provider_message_id)
            .await?
            .is_some()
        {
            return Ok(IngestOutcome::Duplicate);
        }

        let id = Uuid::new_v4();
        let normalizer = self.normalizer.clone();
        let bytes = raw.raw;
        let canonical = task::spawn_blocking(move || normalizer.parse(id, &bytes))
            .await
            .map_err(|err| EmailError::Data(format!("normalize task failed: {err}")))??;

        let message = build_message(id, account, raw.provider_message_id, raw.origin, canonical);
        match self.storage.create_message(&message).await {
            Ok(()) => {}
            Err(StorageError::Duplicate(_)) => {
                self.normalizer.discard_attachments(id);
                return Ok(IngestOutcome::Duplicate);
            }
            Err(err) => {
                self.normalizer.discard_attachments(id);
                return Err(err.into());
            }
        }

        let event = QueueEvent {
            email_id: id,
            account_id: account.id,
            user_id: account.user_id,
        };
        if let Err(err) = self.queue.publish(&event).await {
            tracing::error!(email_id = %id, account_id = %account.id, "failed to enqueue stored message: {err}");
        }

        tracing::info!(
            email_id = %id,
            account_id = %account.id,
            subject = message.subject.as_deref().unwrap_or_default(),
            "stored new message"
        );
        Ok(IngestOutcome::Stored(id))
    }

    /// Ingests every message, logging and counting individual failures.
    pub async fn ingest_all(&self, account: &Account, raws: Vec<RawMessage>) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for raw in raws {
            let provider_id = raw.provider_message_id.clone();
            let outcome = self.ingest(account, raw).await;
            if let Err(err) = &outcome {
                tracing::warn!(
                    account_id = %account.id,
                    provider_message_id = %provider_id,
                    "failed to ingest message: {err}"
                );
            }
            summary.record(&outcome);
        }
        summary
    }
}

fn build_message(
    id: Uuid,
    account: &Account,
    provider_message_id: String,
    origin: MessageOrigin,
    canonical: CanonicalMessage,
) -> MailMessage {
    let now = Utc::now();
    let (imap_uid, gmail_id, thread_id) = match origin {
        MessageOrigin::Imap { uid } => (Some(uid), None, None),
        MessageOrigin::Gmail {
            gmail_id,
            thread_id,
        } => (None, Some(gmail_id), thread_id),
    };

    MailMessage {
        id,
        account_id: account.id,
        provider_message_id,
        message_id_header: canonical.message_id_header,
        thread_id,
        gmail_id,
        imap_uid,
        from: canonical.from,
        to: canonical.to,
        subject: canonical.subject,
        sent_at: canonical.sent_at,
        body_text: canonical.body_text,
        body_html: canonical.body_html,
        sanitized_html: canonical.sanitized_html,
        in_reply_to: canonical.in_reply_to,
        references: canonical.references,
        attachments: canonical.attachments,
        is_read: false,
        is_notified: false,
        notified_at: None,
        summary: SummaryFields::default(),
        created_at: now,
        updated_at: now,
    }
}
