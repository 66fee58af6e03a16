use crate::{AppConfig, ConfigError};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const ORG: &str = "io";
const AUTHOR: &str = "Sift";
const APP: &str = "Sift";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(ORG, AUTHOR, APP).ok_or(ConfigError::MissingDirectories)?;
        Self::with_dirs(
            dirs.config_dir().to_path_buf(),
            dirs.data_dir().to_path_buf(),
            dirs.cache_dir().to_path_buf(),
        )
    }

    /// Lay the config, data and cache directories out under one root.
    pub fn at(root: &Path) -> Result<Self, ConfigError> {
        Self::with_dirs(root.join("config"), root.join("data"), root.join("cache"))
    }

    fn with_dirs(
        config_dir: PathBuf,
        data_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        fs::create_dir_all(&config_dir)?;
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&cache_dir)?;

        let config_path = config_dir.join("config.toml");
        if !config_path.exists() {
            let initial = AppConfig::default();
            let content = toml::to_string_pretty(&initial)?;
            fs::write(&config_path, content)?;
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
        config.validate()?;
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
}

#[cfg(test)]
mod tests {
    use super::ConfigManager;
    use crate::{AccountConfig, AppConfig};
    use uuid::Uuid;

    #[test]
    fn first_run_writes_loadable_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = ConfigManager::at(dir.path()).expect("manager");
        assert!(manager.config_path().exists());

        let config = manager.load().expect("load defaults");
        assert_eq!(config.sync.fetch_batch_size, 100);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn account_defaults_fill_in_port_and_inbox() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = ConfigManager::at(dir.path()).expect("manager");
        let id = Uuid::new_v4();
        let raw = format!(
            r#"
version = 1
profile_name = "home"

[database]
file_name = "mail.sqlite3"

[sync]
poll_interval_secs = 60
max_parallel_accounts = 2
fetch_batch_size = 50
retry_attempts = 2
retry_base_delay_ms = 100

[[accounts]]
id = "{id}"
email_address = "me@example.com"
imap_host = "imap.example.com"
username = "me"
"#
        );
        std::fs::write(manager.config_path(), raw).expect("write config");

        let config = manager.load().expect("load");
        let account = config.account(id).expect("account present");
        assert_eq!(account.imap_port, 993);
        assert_eq!(account.folders, vec!["INBOX".to_string()]);
        assert!(config.sync.flag_resync);
        assert_eq!(config.automation.max_parallel_messages, 8);
    }

    #[test]
    fn duplicate_account_ids_are_rejected() {
        let id = Uuid::new_v4();
        let account = AccountConfig {
            id,
            email_address: "me@example.com".to_string(),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            username: "me".to_string(),
            folders: vec!["INBOX".to_string()],
            trash_folder: None,
        };
        let config = AppConfig {
            accounts: vec![account.clone(), account],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
