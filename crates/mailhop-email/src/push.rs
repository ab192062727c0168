use crate::{EmailError, IngestSummary, Ingestor, PushMailbox, RawMessage};
use chrono::Utc;
use mailhop_core::{Account, PushCursor};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Fetcher for push-capable mailboxes.
///
/// Keeps a registered watch alive and turns push notifications into
/// incremental history syncs. The cursor mutex serializes notifications and
/// renewals for the account.
pub struct PushWatcher {
    account_id: Uuid,
    email_address: String,
    mailbox: Arc<dyn PushMailbox>,
    ingestor: Ingestor,
    renewal_interval: Duration,
    cursor: Mutex<PushCursor>,
}

impl PushWatcher {
    pub fn new(
        account: &Account,
        mailbox: Arc<dyn PushMailbox>,
        ingestor: Ingestor,
        renewal_interval: Duration,
    ) -> Self {
        Self {
            account_id: account.id,
            email_address: account.email_address.clone(),
            mailbox,
            ingestor,
            renewal_interval,
            cursor: Mutex::new(account.cursor.clone()),
        }
    }

    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    pub fn email_address(&self) -> &str {
        &self.email_address
    }

    pub async fn cursor(&self) -> PushCursor {
        self.cursor.lock().await.clone()
    }

    /// Registers a watch unless the stored one is still valid, then pulls
    /// every unread inbox message once.
    pub async fn start(&self) -> Result<IngestSummary, EmailError> {
        let account = {
            let mut cursor = self.cursor.lock().await;
            let account = self.load_account().await?;
            *cursor = account.cursor.clone();
            if !cursor.watch_is_current(Utc::now()) {
                let registration = self.mailbox.register_watch().await?;
                cursor.history_id = Some(registration.history_id);
                cursor.watch_expires_at = Some(registration.expires_at);
                self.ingestor
                    .storage()
                    .update_push_cursor(self.account_id, &cursor)
                    .await?;
                tracing::info!(
                    account_id = %self.account_id,
                    history_id = registration.history_id,
                    expires_at = %registration.expires_at,
                    "registered push watch"
                );
            }
            account
        };

        let summary = self.full_sync(&account).await?;
        self.ingestor
            .storage()
            .record_fetch_success(self.account_id, Utc::now())
            .await?;
        Ok(summary)
    }

    /// Re-registers the watch. A history cursor that is already set is
    /// kept so additions between the last sync and the renewal are not
    /// skipped.
    pub async fn renew_watch(&self) -> Result<(), EmailError> {
        let mut cursor = self.cursor.lock().await;
        let registration = self.mailbox.register_watch().await?;
        cursor.watch_expires_at = Some(registration.expires_at);
        if cursor.history_id.is_none() {
            cursor.history_id = Some(registration.history_id);
        }
        self.ingestor
            .storage()
            .update_push_cursor(self.account_id, &cursor)
            .await?;

        tracing::info!(account_id = %self.account_id, expires_at = %registration.expires_at, "renewed push watch");
        Ok(())
    }

    /// Processes additions in `(stored cursor, new_history_id]` and advances
    /// the cursor to `new_history_id`. Without a stored cursor, falls back to
    /// a full unread sync.
    pub async fn handle_notification(&self, new_history_id: u64) -> Result<IngestSummary, EmailError> {
        let mut cursor = self.cursor.lock().await;
        let account = self.load_account().await?;

        let result = match cursor.history_id {
            None => self.full_sync(&account).await,
            Some(prior) if new_history_id <= prior => {
                tracing::debug!(
                    account_id = %self.account_id,
                    prior,
                    new_history_id,
                    "ignoring stale push notification"
                );
                return Ok(IngestSummary::default());
            }
            Some(prior) => self.incremental_sync(&account, prior, new_history_id).await,
        };

        let storage = self.ingestor.storage();
        match result {
            Ok(summary) => {
                cursor.history_id = Some(new_history_id);
                storage.update_push_cursor(self.account_id, &cursor).await?;
                storage.record_fetch_success(self.account_id, Utc::now()).await?;
                Ok(summary)
            }
            Err(err) => {
                tracing::warn!(account_id = %self.account_id, "push sync failed: {err}");
                if let Err(record_err) = storage.record_fetch_error(self.account_id, &err.to_string()).await {
                    tracing::error!(account_id = %self.account_id, "cannot record fetch error: {record_err}");
                }
                Err(err)
            }
        }
    }

    /// Initial sync, then watch renewal until cancelled. Notifications arrive
    /// separately through [`PushWatcher::handle_notification`].
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(account_id = %self.account_id, "push watcher started");

        if let Err(err) = self.start().await {
            tracing::warn!(account_id = %self.account_id, "push watcher setup failed: {err}");
            self.record_error(&err).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.renewal_interval) => {
                    if let Err(err) = self.renew_watch().await {
                        tracing::warn!(account_id = %self.account_id, "watch renewal failed: {err}");
                        self.record_error(&err).await;
                    }
                }
            }
        }

        tracing::info!(account_id = %self.account_id, "push watcher stopped");
    }

    async fn load_account(&self) -> Result<Account, EmailError> {
        self.ingestor
            .storage()
            .get_account(self.account_id)
            .await?
            .ok_or(EmailError::AccountNotFound(self.account_id))
    }

    async fn record_error(&self, err: &EmailError) {
        if let Err(record_err) = self
            .ingestor
            .storage()
            .record_fetch_error(self.account_id, &err.to_string())
            .await
        {
            tracing::error!(account_id = %self.account_id, "cannot record fetch error: {record_err}");
        }
    }

    async fn full_sync(&self, account: &Account) -> Result<IngestSummary, EmailError> {
        let ids = self.mailbox.list_unread().await?;
        Ok(self.fetch_and_ingest(account, ids).await)
    }

    async fn incremental_sync(
        &self,
        account: &Account,
        prior: u64,
        new_history_id: u64,
    ) -> Result<IngestSummary, EmailError> {
        let records = self.mailbox.history_since(prior).await?;

        let mut seen = HashSet::new();
        let ids: Vec<String> = records
            .into_iter()
            .filter(|record| record.history_id > prior && record.history_id <= new_history_id)
            .flat_map(|record| record.message_ids)
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Ok(self.fetch_and_ingest(account, ids).await)
    }

    async fn fetch_and_ingest(&self, account: &Account, ids: Vec<String>) -> IngestSummary {
        let mut raws: Vec<RawMessage> = Vec::with_capacity(ids.len());
        let mut summary = IngestSummary::default();
        for id in ids {
            match self.mailbox.fetch_message(&id).await {
                Ok(raw) => raws.push(raw),
                Err(err) => {
                    tracing::warn!(account_id = %self.account_id, gmail_id = %id, "failed to fetch message: {err}");
                    summary.failed += 1;
                }
            }
        }

        let ingested = self.ingestor.ingest_all(account, raws).await;
        IngestSummary {
            stored: ingested.stored,
            duplicates: ingested.duplicates,
            failed: summary.failed + ingested.failed,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::PushWatcher;
    use crate::ingest::tests::fixture;
    use crate::{
        EmailError, HistoryRecord, MessageOrigin, PushMailbox, RawMessage, WatchRegistration,
    };
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use mailhop_core::{PushCursor, Provider};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct FakeMailbox {
        pub unread: Vec<String>,
        pub history: Vec<HistoryRecord>,
        pub watch_history_id: u64,
        pub watch_calls: AtomicUsize,
        pub fetched: Mutex<Vec<String>>,
        pub history_starts: Mutex<Vec<u64>>,
        pub missing: HashSet<String>,
    }

    #[async_trait]
    impl PushMailbox for FakeMailbox {
        async fn register_watch(&self) -> Result<WatchRegistration, EmailError> {
            self.watch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(WatchRegistration {
                history_id: self.watch_history_id,
                expires_at: Utc::now() + ChronoDuration::days(7),
            })
        }

        async fn list_unread(&self) -> Result<Vec<String>, EmailError> {
            Ok(self.unread.clone())
        }

        async fn history_since(&self, start: u64) -> Result<Vec<HistoryRecord>, EmailError> {
            self.history_starts.lock().expect("starts").push(start);
            Ok(self
                .history
                .iter()
                .filter(|record| record.history_id > start)
                .cloned()
                .collect())
        }

        async fn fetch_message(&self, provider_id: &str) -> Result<RawMessage, EmailError> {
            if self.missing.contains(provider_id) {
                return Err(EmailError::Provider("Gmail get message failed with status 404".to_string()));
            }
            self.fetched.lock().expect("fetched").push(provider_id.to_string());
            Ok(RawMessage {
                provider_message_id: provider_id.to_string(),
                origin: MessageOrigin::Gmail {
                    gmail_id: provider_id.to_string(),
                    thread_id: None,
                },
                raw: format!("From: a@example.com\r\nSubject: {provider_id}\r\n\r\nbody\r\n").into_bytes(),
            })
        }
    }

    fn record(history_id: u64, ids: &[&str]) -> HistoryRecord {
        HistoryRecord {
            history_id,
            message_ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn notification_processes_only_the_new_history_window() {
        let mut fx = fixture(Provider::Gmail).await;
        fx.account.cursor = PushCursor {
            history_id: Some(100),
            watch_expires_at: Some(Utc::now() + ChronoDuration::days(3)),
        };
        fx.storage
            .update_push_cursor(fx.account.id, &fx.account.cursor)
            .await
            .expect("cursor");

        let mailbox = Arc::new(FakeMailbox {
            history: vec![
                record(101, &["m1"]),
                record(102, &["m2", "m1"]),
                record(150, &["m3"]),
            ],
            ..FakeMailbox::default()
        });
        let watcher = PushWatcher::new(
            &fx.account,
            mailbox.clone(),
            fx.ingestor.clone(),
            Duration::from_secs(3600),
        );

        let summary = watcher.handle_notification(120).await.expect("sync");
        assert_eq!(summary.stored, 2);
        assert_eq!(*mailbox.fetched.lock().expect("fetched"), vec!["m1", "m2"]);
        assert_eq!(*mailbox.history_starts.lock().expect("starts"), vec![100]);
        assert_eq!(watcher.cursor().await.history_id, Some(120));

        let stored = fx.storage.get_account(fx.account.id).await.expect("get").expect("row");
        assert_eq!(stored.cursor.history_id, Some(120));
        assert_eq!(fx.queue.len().await.expect("len"), 2);

        let stale = watcher.handle_notification(110).await.expect("stale");
        assert_eq!(stale.stored, 0);
        assert_eq!(mailbox.history_starts.lock().expect("starts").len(), 1);
    }

    #[tokio::test]
    async fn missing_cursor_falls_back_to_full_sync() {
        let fx = fixture(Provider::Gmail).await;
        let mailbox = Arc::new(FakeMailbox {
            unread: vec!["u1".to_string(), "u2".to_string()],
            ..FakeMailbox::default()
        });
        let watcher = PushWatcher::new(
            &fx.account,
            mailbox.clone(),
            fx.ingestor.clone(),
            Duration::from_secs(3600),
        );

        let summary = watcher.handle_notification(500).await.expect("sync");
        assert_eq!(summary.stored, 2);
        assert!(mailbox.history_starts.lock().expect("starts").is_empty());
        assert_eq!(watcher.cursor().await.history_id, Some(500));
    }

    #[tokio::test]
    async fn start_registers_watch_only_when_expired() {
        let fx = fixture(Provider::Gmail).await;
        let mailbox = Arc::new(FakeMailbox {
            unread: vec!["u1".to_string()],
            watch_history_id: 77,
            ..FakeMailbox::default()
        });
        let watcher = PushWatcher::new(
            &fx.account,
            mailbox.clone(),
            fx.ingestor.clone(),
            Duration::from_secs(3600),
        );

        let summary = watcher.start().await.expect("start");
        assert_eq!(summary.stored, 1);
        assert_eq!(mailbox.watch_calls.load(Ordering::SeqCst), 1);
        let cursor = watcher.cursor().await;
        assert_eq!(cursor.history_id, Some(77));
        assert!(cursor.watch_is_current(Utc::now()));

        watcher.start().await.expect("restart");
        assert_eq!(mailbox.watch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn renewal_keeps_existing_cursor() {
        let mut fx = fixture(Provider::Gmail).await;
        fx.account.cursor.history_id = Some(40);
        let mailbox = Arc::new(FakeMailbox {
            watch_history_id: 90,
            ..FakeMailbox::default()
        });
        let watcher = PushWatcher::new(
            &fx.account,
            mailbox,
            fx.ingestor.clone(),
            Duration::from_secs(3600),
        );

        watcher.renew_watch().await.expect("renew");
        let cursor = watcher.cursor().await;
        assert_eq!(cursor.history_id, Some(40));
        assert!(cursor.watch_expires_at.is_some());
    }

    #[tokio::test]
    async fn fetch_failures_are_counted_not_fatal() {
        let mut fx = fixture(Provider::Gmail).await;
        fx.account.cursor.history_id = Some(1);
        fx.storage
            .update_push_cursor(fx.account.id, &fx.account.cursor)
            .await
            .expect("cursor");
        let mailbox = Arc::new(FakeMailbox {
            history: vec![record(2, &["gone", "ok"])],
            missing: HashSet::from(["gone".to_string()]),
            ..FakeMailbox::default()
        });
        let watcher = PushWatcher::new(
            &fx.account,
            mailbox,
            fx.ingestor.clone(),
            Duration::from_secs(3600),
        );

        let summary = watcher.handle_notification(2).await.expect("sync");
        assert_eq!(summary.stored, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(watcher.cursor().await.history_id, Some(2));
    }
}
