use crate::{EmailError, Fetcher, Ingestor, MailboxConnector, Poller, PushWatcher};
use mailhop_core::{Account, Provider};
use mailhop_storage::Storage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub watch_renewal: Duration,
}

struct RunningFetcher {
    fetcher: Arc<Fetcher>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns one fetcher task per active account.
///
/// Each fetcher runs under its own child cancellation token, so one
/// account's failures or shutdown never touch another's.
pub struct FetchManager {
    storage: Storage,
    ingestor: Ingestor,
    connector: Arc<dyn MailboxConnector>,
    settings: FetchSettings,
    running: RwLock<HashMap<Uuid, RunningFetcher>>,
    shutdown: CancellationToken,
}

impl FetchManager {
    pub fn new(
        ingestor: Ingestor,
        connector: Arc<dyn MailboxConnector>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            storage: ingestor.storage().clone(),
            ingestor,
            connector,
            settings,
            running: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts a fetcher for every active account and the periodic
    /// reconciliation that picks up accounts linked later. Accounts that
    /// fail to start are logged and skipped.
    pub async fn start(self: &Arc<Self>) -> Result<usize, EmailError> {
        let started = self.reconcile().await?;
        tracing::info!(started, "fetch manager started");

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.reconcile_loop().await });
        Ok(started)
    }

    /// Signals every fetcher and the reconciliation loop to stop.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let drained: Vec<RunningFetcher> = self.running.write().await.drain().map(|(_, r)| r).collect();
        for running in &drained {
            running.cancel.cancel();
        }
        tracing::info!(stopped = drained.len(), "fetch manager stopped");
    }

    /// Starts fetchers for active accounts that have none, replacing any
    /// whose task has ended. Returns how many were started.
    pub async fn reconcile(&self) -> Result<usize, EmailError> {
        self.running
            .write()
            .await
            .retain(|_, running| !running.task.is_finished());

        let accounts = self.storage.list_active_accounts().await?;
        let mut started = 0;
        for account in accounts {
            match self.launch(&account).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(account_id = %account.id, email = %account.email_address, "fetcher not started: {err}");
                }
            }
        }

        Ok(started)
    }

    /// Idempotent: returns `Ok(false)` when a fetcher is already running.
    pub async fn start_fetcher_for_account(&self, account_id: Uuid) -> Result<bool, EmailError> {
        let account = self
            .storage
            .get_account(account_id)
            .await?
            .ok_or(EmailError::AccountNotFound(account_id))?;
        if !account.is_active {
            return Err(EmailError::Config("account is not active".to_string()));
        }

        self.launch(&account).await
    }

    /// Idempotent: returns false when nothing was running.
    pub async fn stop_fetcher_for_account(&self, account_id: Uuid) -> bool {
        let Some(running) = self.running.write().await.remove(&account_id) else {
            return false;
        };

        running.cancel.cancel();
        tracing::info!(account_id = %account_id, kind = running.fetcher.kind(), "fetcher stopped");
        true
    }

    pub async fn is_running(&self, account_id: Uuid) -> bool {
        self.running.read().await.contains_key(&account_id)
    }

    pub async fn running_accounts(&self) -> Vec<Uuid> {
        self.running.read().await.keys().copied().collect()
    }

    /// Routes a push notification to the watcher of the account with this
    /// address. Returns false when no such watcher is running.
    pub async fn dispatch_push(&self, email_address: &str, history_id: u64) -> Result<bool, EmailError> {
        let fetcher = self
            .running
            .read()
            .await
            .values()
            .find(|running| {
                running
                    .fetcher
                    .as_push()
                    .is_some_and(|watcher| watcher.email_address().eq_ignore_ascii_case(email_address))
            })
            .map(|running| Arc::clone(&running.fetcher));

        let Some(watcher) = fetcher.as_deref().and_then(Fetcher::as_push) else {
            tracing::warn!(email = %email_address, history_id, "push notification for unknown account");
            return Ok(false);
        };

        watcher.handle_notification(history_id).await?;
        Ok(true)
    }

    async fn launch(&self, account: &Account) -> Result<bool, EmailError> {
        if self.shutdown.is_cancelled() {
            return Ok(false);
        }

        let mut running = self.running.write().await;
        if running.contains_key(&account.id) {
            return Ok(false);
        }

        let fetcher = match self.build_fetcher(account) {
            Ok(fetcher) => Arc::new(fetcher),
            Err(err) => {
                if let Err(record_err) = self
                    .storage
                    .record_fetch_error(account.id, &err.to_string())
                    .await
                {
                    tracing::error!(account_id = %account.id, "cannot record fetcher error: {record_err}");
                }
                return Err(err);
            }
        };

        let cancel = self.shutdown.child_token();
        let task = {
            let fetcher = Arc::clone(&fetcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { fetcher.run(cancel).await })
        };

        tracing::info!(
            account_id = %account.id,
            email = %account.email_address,
            kind = fetcher.kind(),
            "fetcher started"
        );
        running.insert(
            account.id,
            RunningFetcher {
                fetcher,
                cancel,
                task,
            },
        );
        Ok(true)
    }

    fn build_fetcher(&self, account: &Account) -> Result<Fetcher, EmailError> {
        match &account.provider {
            Provider::Imap => Ok(Fetcher::Poll(Poller::new(
                account.id,
                self.connector.unseen_source(account)?,
                self.ingestor.clone(),
                self.settings.poll_interval,
            ))),
            Provider::Gmail => Ok(Fetcher::Push(PushWatcher::new(
                account,
                self.connector.push_mailbox(account)?,
                self.ingestor.clone(),
                self.settings.watch_renewal,
            ))),
            Provider::Unsupported(other) => Err(EmailError::Config(format!(
                "unsupported provider: {other}"
            ))),
        }
    }

    async fn reconcile_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconcile_interval) => {
                    match self.reconcile().await {
                        Ok(0) => {}
                        Ok(started) => tracing::info!(started, "reconciliation started new fetchers"),
                        Err(err) => tracing::warn!("reconciliation failed: {err}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FetchManager, FetchSettings};
    use crate::ingest::tests::{fixture, raw, Fixture};
    use crate::poller::tests::ScriptedSource;
    use crate::push::tests::FakeMailbox;
    use crate::{EmailError, MailboxConnector, PushMailbox, UnseenSource};
    use mailhop_core::{Account, Provider, PushCursor};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeConnector {
        sources: HashMap<Uuid, Arc<ScriptedSource>>,
        mailboxes: HashMap<Uuid, Arc<FakeMailbox>>,
    }

    impl MailboxConnector for FakeConnector {
        fn unseen_source(&self, account: &Account) -> Result<Arc<dyn UnseenSource>, EmailError> {
            match self.sources.get(&account.id) {
                Some(source) => Ok(source.clone()),
                None => Err(EmailError::Config("IMAP credentials not configured".to_string())),
            }
        }

        fn push_mailbox(&self, account: &Account) -> Result<Arc<dyn PushMailbox>, EmailError> {
            match self.mailboxes.get(&account.id) {
                Some(mailbox) => Ok(mailbox.clone()),
                None => Err(EmailError::Config("Gmail push is not configured".to_string())),
            }
        }
    }

    fn settings() -> FetchSettings {
        FetchSettings {
            poll_interval: Duration::from_secs(3600),
            reconcile_interval: Duration::from_secs(3600),
            watch_renewal: Duration::from_secs(3600),
        }
    }

    async fn second_account(fx: &Fixture, provider: Provider, email: &str) -> Account {
        let account = Account::new(fx.account.user_id, provider, email);
        fx.storage.create_account(&account).await.expect("account");
        account
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn one_failing_account_does_not_affect_another() {
        let fx = fixture(Provider::Imap).await;
        let other = second_account(&fx, Provider::Imap, "other@example.com").await;

        let broken = Arc::new(ScriptedSource::failing("authentication failed"));
        let healthy = Arc::new(ScriptedSource::serving(vec![raw("<h1@example.com>", "Hi")]));
        let connector = FakeConnector {
            sources: HashMap::from([(fx.account.id, broken.clone()), (other.id, healthy.clone())]),
            ..FakeConnector::default()
        };
        let manager = Arc::new(FetchManager::new(fx.ingestor.clone(), Arc::new(connector), settings()));

        assert_eq!(manager.start().await.expect("start"), 2);
        wait_until(|| {
            let storage = fx.storage.clone();
            let broken = broken.clone();
            async move {
                broken.calls.load(Ordering::SeqCst) > 0
                    && storage.count_messages_for_account(other.id).await.unwrap_or(0) == 1
            }
        })
        .await;

        let failed = fx.storage.get_account(fx.account.id).await.expect("get").expect("row");
        assert!(failed.last_error.as_deref().unwrap_or_default().contains("authentication failed"));
        let fine = fx.storage.get_account(other.id).await.expect("get").expect("row");
        assert!(fine.last_error.is_none());
        assert!(manager.is_running(fx.account.id).await);
        assert!(manager.is_running(other.id).await);

        manager.stop().await;
        assert!(manager.running_accounts().await.is_empty());
    }

    #[tokio::test]
    async fn starting_twice_runs_one_fetcher() {
        let fx = fixture(Provider::Imap).await;
        let source = Arc::new(ScriptedSource::serving(Vec::new()));
        let connector = FakeConnector {
            sources: HashMap::from([(fx.account.id, source)]),
            ..FakeConnector::default()
        };
        let manager = FetchManager::new(fx.ingestor.clone(), Arc::new(connector), settings());

        assert!(manager.start_fetcher_for_account(fx.account.id).await.expect("start"));
        assert!(!manager.start_fetcher_for_account(fx.account.id).await.expect("again"));
        assert_eq!(manager.running_accounts().await, vec![fx.account.id]);

        assert!(manager.stop_fetcher_for_account(fx.account.id).await);
        assert!(!manager.stop_fetcher_for_account(fx.account.id).await);
        assert!(!manager.is_running(fx.account.id).await);
    }

    #[tokio::test]
    async fn start_rejects_missing_inactive_and_unsupported_accounts() {
        let fx = fixture(Provider::Imap).await;
        let manager = FetchManager::new(
            fx.ingestor.clone(),
            Arc::new(FakeConnector::default()),
            settings(),
        );

        let err = manager.start_fetcher_for_account(Uuid::new_v4()).await.expect_err("missing");
        assert!(matches!(err, EmailError::AccountNotFound(_)));

        let mut inactive = second_account(&fx, Provider::Imap, "off@example.com").await;
        inactive.is_active = false;
        fx.storage.update_account(&inactive).await.expect("update");
        let err = manager.start_fetcher_for_account(inactive.id).await.expect_err("inactive");
        assert_eq!(err.to_string(), "account is not active");

        let odd = second_account(&fx, Provider::from("outlook"), "odd@example.com").await;
        let err = manager.start_fetcher_for_account(odd.id).await.expect_err("unsupported");
        assert_eq!(err.to_string(), "unsupported provider: outlook");
        let stored = fx.storage.get_account(odd.id).await.expect("get").expect("row");
        assert_eq!(stored.last_error.as_deref(), Some("unsupported provider: outlook"));

        let err = manager.start_fetcher_for_account(fx.account.id).await.expect_err("no creds");
        assert!(err.is_config());
        assert!(manager.running_accounts().await.is_empty());
    }

    #[tokio::test]
    async fn reconcile_picks_up_new_accounts() {
        let fx = fixture(Provider::Imap).await;
        let manager = FetchManager::new(
            fx.ingestor.clone(),
            Arc::new(FakeConnector {
                sources: HashMap::from([(
                    fx.account.id,
                    Arc::new(ScriptedSource::serving(Vec::new())),
                )]),
                ..FakeConnector::default()
            }),
            settings(),
        );

        assert_eq!(manager.reconcile().await.expect("reconcile"), 1);
        assert_eq!(manager.reconcile().await.expect("reconcile"), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn push_notifications_reach_the_matching_watcher() {
        let fx = fixture(Provider::Imap).await;
        let gmail = second_account(&fx, Provider::Gmail, "Push@Example.com").await;
        fx.storage
            .update_push_cursor(
                gmail.id,
                &PushCursor {
                    history_id: Some(10),
                    watch_expires_at: Some(chrono::Utc::now() + chrono::Duration::days(5)),
                },
            )
            .await
            .expect("cursor");

        let mailbox = Arc::new(FakeMailbox {
            history: vec![crate::HistoryRecord {
                history_id: 11,
                message_ids: vec!["g1".to_string()],
            }],
            ..FakeMailbox::default()
        });
        let connector = FakeConnector {
            mailboxes: HashMap::from([(gmail.id, mailbox.clone())]),
            ..FakeConnector::default()
        };
        let manager = FetchManager::new(fx.ingestor.clone(), Arc::new(connector), settings());
        assert!(manager.start_fetcher_for_account(gmail.id).await.expect("start"));

        assert!(manager.dispatch_push("push@example.com", 11).await.expect("dispatch"));
        assert!(!manager.dispatch_push("nobody@example.com", 11).await.expect("dispatch"));
        wait_until(|| {
            let storage = fx.storage.clone();
            async move { storage.count_messages_for_account(gmail.id).await.unwrap_or(0) == 1 }
        })
        .await;
        assert_eq!(mailbox.watch_calls.load(Ordering::SeqCst), 0);
        manager.stop().await;
    }
}
