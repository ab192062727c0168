use crate::{AppConfig, ConfigError};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const ORG: &str = "io";
const AUTHOR: &str = "mailhop";
const APP: &str = "mailhop";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ConfigManager {
    /// Uses the platform config/data/cache directories, writing a default
    /// `config.toml` on first run.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(ORG, AUTHOR, APP).ok_or(ConfigError::MissingDirectories)?;
        let config_dir = dirs.config_dir().to_path_buf();
        let data_dir = dirs.data_dir().to_path_buf();
        let cache_dir = dirs.cache_dir().to_path_buf();

        fs::create_dir_all(&config_dir)?;
        Self::with_layout(config_dir.join("config.toml"), data_dir, cache_dir)
    }

    /// Loads an explicit config file; data and cache live next to it.
    pub fn from_path(config_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = config_path.into();
        let base = config_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::with_layout(config_path, base.join("data"), base.join("cache"))
    }

    fn with_layout(
        config_path: PathBuf,
        data_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&cache_dir)?;

        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let initial = AppConfig::default();
            fs::write(&config_path, toml::to_string_pretty(&initial)?)?;
            tracing::info!(path = %config_path.display(), "wrote default config");
        }

        Ok(Self {
            config_path,
            data_dir,
            cache_dir,
        })
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let content = fs::read_to_string(&self.config_path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn database_path(&self, config: &AppConfig) -> PathBuf {
        self.data_dir.join(&config.database.file_name)
    }

    pub fn attachments_dir(&self, config: &AppConfig) -> PathBuf {
        let configured = Path::new(&config.storage.attachments_path);
        if configured.is_absolute() {
            configured.to_path_buf()
        } else {
            self.data_dir.join(configured)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigManager;
    use crate::AppConfig;

    #[test]
    fn writes_defaults_and_round_trips_changes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let manager = ConfigManager::from_path(dir.path().join("mailhop.toml")).expect("manager");

        let loaded = manager.load().expect("default config loads");
        assert_eq!(loaded.fetcher.imap_poll_interval_secs, 60);
        assert_eq!(loaded.llm.cache_ttl_hours, 24);
        assert_eq!(loaded.sessions.link_ttl_secs, 600);

        let mut changed = loaded.clone();
        changed.llm.enabled = true;
        changed.web.base_url = "https://mail.example.com".to_string();
        manager.save(&changed).expect("save");

        let reloaded = manager.load().expect("reload");
        assert!(reloaded.llm.enabled);
        assert_eq!(reloaded.web.base_url, "https://mail.example.com");
        assert_eq!(
            manager.attachments_dir(&reloaded),
            dir.path().join("data").join("attachments")
        );
    }

    #[test]
    fn partial_files_fall_back_to_section_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [fetcher]
            imap_poll_interval_secs = 15

            [llm]
            enabled = true
            "#,
        )
        .expect("parse");

        assert_eq!(config.fetcher.imap_poll_interval_secs, 15);
        assert_eq!(config.fetcher.reconcile_interval_secs, 300);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.queue.list_key, "mailhop:queue:emails");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let mut config = AppConfig::default();
        config.fetcher.imap_poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
