use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub environment: String,
    pub database: DatabaseConfig,
    pub fetcher: FetcherConfig,
    pub queue: QueueConfig,
    pub telegram: TelegramConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub llm: LlmConfig,
    pub sessions: SessionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            database: DatabaseConfig::default(),
            fetcher: FetcherConfig::default(),
            queue: QueueConfig::default(),
            telegram: TelegramConfig::default(),
            web: WebConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            llm: LlmConfig::default(),
            sessions: SessionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Rejects values that would make a worker spin or never fire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetcher.imap_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetcher.imap_poll_interval_secs must be positive".to_string(),
            ));
        }
        if self.fetcher.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetcher.reconcile_interval_secs must be positive".to_string(),
            ));
        }
        if self.queue.list_key.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.list_key is empty".to_string()));
        }
        if self.llm.enabled && self.llm.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "llm.timeout_secs must be positive when llm is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub file_name: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file_name: "mailhop.sqlite3".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub imap_poll_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub gmail: GmailConfig,
}

impl FetcherConfig {
    pub fn imap_poll_interval(&self) -> Duration {
        Duration::from_secs(self.imap_poll_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            imap_poll_interval_secs: 60,
            reconcile_interval_secs: 300,
            gmail: GmailConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    pub project_id: String,
    pub pubsub_topic: String,
    pub pubsub_subscription: String,
    pub client_id: String,
    pub token_url: String,
    pub watch_renewal_secs: u64,
    pub pull_interval_secs: u64,
}

impl GmailConfig {
    /// Push accounts need a topic to register watches against.
    pub fn is_configured(&self) -> bool {
        !self.project_id.is_empty() && !self.pubsub_topic.is_empty()
    }

    pub fn topic_name(&self) -> String {
        format!("projects/{}/topics/{}", self.project_id, self.pubsub_topic)
    }

    pub fn subscription_name(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project_id, self.pubsub_subscription
        )
    }

    pub fn watch_renewal(&self) -> Duration {
        Duration::from_secs(self.watch_renewal_secs)
    }
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            pubsub_topic: String::new(),
            pubsub_subscription: String::new(),
            client_id: String::new(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            // Gmail watches lapse after seven days.
            watch_renewal_secs: 6 * 24 * 60 * 60,
            pull_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub list_key: String,
    pub pop_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            list_key: "mailhop:queue:emails".to_string(),
            pop_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub api_base: String,
    pub long_poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            long_poll_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub base_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Relative paths resolve under the data directory.
    pub attachments_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            attachments_path: "attachments".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub cache_ttl_hours: u64,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 60 * 60)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 10,
            max_tokens: 300,
            cache_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub link_ttl_secs: u64,
    pub reply_ttl_secs: u64,
    pub view_token_ttl_hours: i64,
}

impl SessionConfig {
    pub fn link_ttl(&self) -> Duration {
        Duration::from_secs(self.link_ttl_secs)
    }

    pub fn reply_ttl(&self) -> Duration {
        Duration::from_secs(self.reply_ttl_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link_ttl_secs: 600,
            reply_ttl_secs: 600,
            view_token_ttl_hours: 24,
        }
    }
}
