use crate::{EmailError, IngestSummary, Ingestor, UnseenSource};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Interval fetcher for mailboxes without push notifications.
pub struct Poller {
    account_id: Uuid,
    source: Arc<dyn UnseenSource>,
    ingestor: Ingestor,
    interval: Duration,
}

impl Poller {
    pub fn new(
        account_id: Uuid,
        source: Arc<dyn UnseenSource>,
        ingestor: Ingestor,
        interval: Duration,
    ) -> Self {
        Self {
            account_id,
            source,
            ingestor,
            interval,
        }
    }

    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    /// One fetch cycle. The account is reloaded each time so credential
    /// changes apply without a restart. Failures land in the account's
    /// `last_error`; success clears it and stamps `last_fetch_at`.
    pub async fn fetch_once(&self) -> Result<IngestSummary, EmailError> {
        let storage = self.ingestor.storage();
        let account = storage
            .get_account(self.account_id)
            .await?
            .ok_or(EmailError::AccountNotFound(self.account_id))?;

        let stored_uids = storage.stored_imap_uids(self.account_id).await?;
        let raws = match self.source.fetch_unseen(&account, &stored_uids).await {
            Ok(raws) => raws,
            Err(err) => {
                if let Err(record_err) = storage
                    .record_fetch_error(self.account_id, &err.to_string())
                    .await
                {
                    tracing::error!(account_id = %self.account_id, "cannot record fetch error: {record_err}");
                }
                return Err(err);
            }
        };

        let fetched = raws.len();
        let summary = self.ingestor.ingest_all(&account, raws).await;
        storage.record_fetch_success(self.account_id, Utc::now()).await?;

        if fetched > 0 {
            tracing::info!(
                account_id = %self.account_id,
                fetched,
                stored = summary.stored,
                duplicates = summary.duplicates,
                failed = summary.failed,
                "poll cycle finished"
            );
        }
        Ok(summary)
    }

    /// Fetches immediately, then once per interval until cancelled or the
    /// account is deleted.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(account_id = %self.account_id, interval_secs = self.interval.as_secs(), "poller started");

        while !cancel.is_cancelled() {
            match self.fetch_once().await {
                Ok(_) => {}
                Err(EmailError::AccountNotFound(_)) => {
                    tracing::info!(account_id = %self.account_id, "account removed, poller exiting");
                    break;
                }
                Err(err) => {
                    tracing::warn!(account_id = %self.account_id, "poll cycle failed: {err}");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!(account_id = %self.account_id, "poller stopped");
    }
}
