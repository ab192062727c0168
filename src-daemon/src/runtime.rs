use crate::cli::Role;
use anyhow::{bail, Context};
use mailhop_ai::{OpenAiSummarizer, SummarizerConfig};
use mailhop_bot::{BotHandler, BotRunner, BotSettings, SessionStore};
use mailhop_config::{AppConfig, ConfigManager};
use mailhop_email::{
    FetchManager, FetchSettings, GmailSettings, Ingestor, Normalizer, ProviderConnector,
    PubSubListener, SmtpReplySender, GMAIL_API_BASE,
};
use mailhop_notify::{NotificationConsumer, TelegramClient};
use mailhop_queue::{EventQueue, QueueConsumer};
use mailhop_security::{CredentialCipher, OAuthRefresher, SecretKey, SecretStore};
use mailhop_storage::{KvStore, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SECRET_SERVICE: &str = "io.mailhop.daemon";
const KV_PURGE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Shared handles for every worker in this process.
pub(crate) struct Runtime {
    config_manager: ConfigManager,
    config: AppConfig,
    storage: Storage,
    kv: KvStore,
    secrets: SecretStore,
}

impl Runtime {
    pub(crate) async fn initialize(
        config_manager: ConfigManager,
        config: AppConfig,
    ) -> anyhow::Result<Self> {
        let db_path = config_manager.database_path(&config);
        let storage = Storage::connect(&db_path, config.database.max_connections)
            .await
            .with_context(|| format!("open database {}", db_path.display()))?;
        let kv = KvStore::new(storage.pool().clone());

        tracing::info!(
            environment = %config.environment,
            database = %db_path.display(),
            "runtime initialized"
        );

        Ok(Self {
            config_manager,
            config,
            storage,
            kv,
            secrets: SecretStore::new(SECRET_SERVICE),
        })
    }

    fn secret(&self, namespace: &str, id: &str) -> Option<String> {
        self.secrets.resolve(&SecretKey::new(namespace, id))
    }

    fn required_secret(&self, namespace: &str, id: &str) -> anyhow::Result<String> {
        let key = SecretKey::new(namespace, id);
        match self.secrets.resolve(&key) {
            Some(value) => Ok(value),
            None => bail!(
                "missing secret {namespace}.{id}: store it in the keychain under {SECRET_SERVICE} or set {}",
                key.env_var()
            ),
        }
    }

    fn cipher(&self) -> anyhow::Result<CredentialCipher> {
        let key = self.required_secret("security", "encryption_key")?;
        CredentialCipher::from_base64_key(&key).context("load credential encryption key")
    }

    fn telegram(&self) -> anyhow::Result<TelegramClient> {
        let token = self.required_secret("telegram", "bot_token")?;
        Ok(TelegramClient::new(&self.config.telegram.api_base, token))
    }

    fn queue(&self) -> EventQueue {
        EventQueue::new(self.kv.clone(), &self.config.queue.list_key)
    }

    fn fetch_manager(&self, cipher: CredentialCipher) -> anyhow::Result<Arc<FetchManager>> {
        let normalizer = Arc::new(Normalizer::new(
            self.config_manager.attachments_dir(&self.config),
        ));
        let ingestor = Ingestor::new(self.storage.clone(), self.queue(), normalizer);

        let gmail = &self.config.fetcher.gmail;
        let mut connector = ProviderConnector::new(cipher);
        if gmail.is_configured() {
            let refresher = if gmail.client_id.is_empty() {
                None
            } else {
                Some(
                    OAuthRefresher::new(
                        &gmail.client_id,
                        self.secret("gmail", "client_secret"),
                        &gmail.token_url,
                    )
                    .context("build gmail token refresher")?,
                )
            };
            connector = connector.with_gmail(
                GmailSettings {
                    api_base: GMAIL_API_BASE.to_string(),
                    topic_name: gmail.topic_name(),
                },
                refresher,
            );
        } else {
            tracing::info!("gmail push is not configured; gmail accounts will not be fetched");
        }

        Ok(Arc::new(FetchManager::new(
            ingestor,
            Arc::new(connector),
            FetchSettings {
                poll_interval: self.config.fetcher.imap_poll_interval(),
                reconcile_interval: self.config.fetcher.reconcile_interval(),
                watch_renewal: gmail.watch_renewal(),
            },
        )))
    }

    fn pubsub_listener(&self, manager: &Arc<FetchManager>) -> Option<PubSubListener> {
        let gmail = &self.config.fetcher.gmail;
        if !gmail.is_configured() || gmail.pubsub_subscription.is_empty() {
            return None;
        }

        let Some(token) = self.secret("gmail", "pubsub_token") else {
            tracing::warn!("gmail.pubsub_token is not set; push notifications will not be pulled");
            return None;
        };

        Some(PubSubListener::new(
            Arc::clone(manager),
            gmail.subscription_name(),
            token,
            Duration::from_secs(gmail.pull_interval_secs.max(1)),
        ))
    }

    fn notifier(&self, telegram: TelegramClient) -> anyhow::Result<QueueConsumer<NotificationConsumer>> {
        let mut consumer =
            NotificationConsumer::new(self.storage.clone(), self.kv.clone(), Arc::new(telegram));

        let llm = &self.config.llm;
        if llm.enabled {
            let summarizer = OpenAiSummarizer::new(SummarizerConfig {
                base_url: llm.base_url.clone(),
                api_key: self.required_secret("llm", "api_key")?,
                model: llm.model.clone(),
                max_tokens: llm.max_tokens,
                timeout: llm.timeout(),
            })
            .context("build summarizer")?;
            consumer = consumer.with_summarizer(Arc::new(summarizer), llm.timeout(), llm.cache_ttl());
            tracing::info!(model = %llm.model, "summaries enabled");
        }

        Ok(QueueConsumer::new(
            self.queue(),
            consumer,
            Duration::from_secs(self.config.queue.pop_timeout_secs.max(1)),
        ))
    }

    fn bot(
        &self,
        telegram: TelegramClient,
        cipher: CredentialCipher,
        manager: Option<&Arc<FetchManager>>,
    ) -> BotRunner {
        let sessions = SessionStore::new(
            self.kv.clone(),
            self.config.sessions.link_ttl(),
            self.config.sessions.reply_ttl(),
        );

        let mut handler = BotHandler::new(
            self.storage.clone(),
            sessions,
            Arc::new(telegram.clone()),
            Arc::new(SmtpReplySender::new(cipher.clone())),
            cipher,
            BotSettings {
                web_base_url: self.config.web.base_url.clone(),
                view_token_ttl: chrono::Duration::hours(self.config.sessions.view_token_ttl_hours),
            },
        );
        if let Some(manager) = manager {
            handler = handler.with_fetcher_control(manager.clone());
        }

        BotRunner::new(
            telegram,
            Arc::new(handler),
            Duration::from_secs(self.config.telegram.long_poll_timeout_secs),
        )
    }

    /// Builds every worker `role` needs, then runs them until `cancel`
    /// fires. Missing secrets fail before any worker starts.
    pub(crate) async fn run(self, role: Role, cancel: CancellationToken) -> anyhow::Result<()> {
        let cipher = if role.runs_fetcher() || role.runs_bot() {
            Some(self.cipher()?)
        } else {
            None
        };
        let telegram = if role.runs_notifier() || role.runs_bot() {
            Some(self.telegram()?)
        } else {
            None
        };

        let manager = match (&cipher, role.runs_fetcher()) {
            (Some(cipher), true) => Some(self.fetch_manager(cipher.clone())?),
            _ => None,
        };
        let listener = manager
            .as_ref()
            .and_then(|manager| self.pubsub_listener(manager));
        let notifier = match (&telegram, role.runs_notifier()) {
            (Some(telegram), true) => Some(self.notifier(telegram.clone())?),
            _ => None,
        };
        let bot = match (&telegram, &cipher, role.runs_bot()) {
            (Some(telegram), Some(cipher), true) => {
                Some(self.bot(telegram.clone(), cipher.clone(), manager.as_ref()))
            }
            _ => None,
        };

        tracing::info!(role = ?role, "starting workers");

        let fetcher_task = async {
            let Some(manager) = &manager else {
                return Ok::<(), anyhow::Error>(());
            };
            let started = manager.start().await.context("start fetch manager")?;
            tracing::info!(started, "fetchers running");

            match &listener {
                Some(listener) => listener.run(cancel.clone()).await,
                None => cancel.cancelled().await,
            }
            manager.stop().await;
            Ok(())
        };

        let notifier_task = async {
            if let Some(notifier) = &notifier {
                notifier.run(cancel.clone()).await;
            }
            Ok::<(), anyhow::Error>(())
        };

        let bot_task = async {
            if let Some(bot) = &bot {
                bot.run(cancel.clone()).await;
            }
            Ok::<(), anyhow::Error>(())
        };

        let purge_task = purge_loop(self.kv.clone(), cancel.clone());

        let result = tokio::try_join!(fetcher_task, notifier_task, bot_task, purge_task);
        if result.is_err() {
            cancel.cancel();
        }
        result.map(|_| ())
    }
}

/// Drops expired sessions and cache entries in bulk; reads already ignore
/// them.
async fn purge_loop(kv: KvStore, cancel: CancellationToken) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(KV_PURGE_INTERVAL) => {}
        }

        match kv.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "purged expired kv entries"),
            Err(err) => tracing::warn!("kv purge failed: {err}"),
        }
    }
}
