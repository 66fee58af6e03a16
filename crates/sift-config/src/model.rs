use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: u32,
    pub profile_name: String,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub poll_interval_secs: u64,
    /// Accounts synchronized concurrently; folders of one account never are.
    pub max_parallel_accounts: usize,
    pub fetch_batch_size: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_true")]
    pub flag_resync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub enabled: bool,
    pub max_parallel_messages: usize,
    pub batch_size: usize,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel_messages: 8,
            batch_size: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: Uuid,
    pub email_address: String,
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub username: String,
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    #[serde(default)]
    pub trash_folder: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            profile_name: "default".to_string(),
            database: DatabaseConfig {
                file_name: "sift.sqlite3".to_string(),
            },
            sync: SyncConfig {
                poll_interval_secs: 300,
                max_parallel_accounts: 4,
                fetch_batch_size: 100,
                retry_attempts: 3,
                retry_base_delay_ms: 500,
                flag_resync: true,
            },
            automation: AutomationConfig::default(),
            logging: LoggingConfig::default(),
            accounts: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.fetch_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "sync.fetch_batch_size must be at least 1".to_string(),
            ));
        }
        if self.sync.max_parallel_accounts == 0 {
            return Err(ConfigError::Invalid(
                "sync.max_parallel_accounts must be at least 1".to_string(),
            ));
        }
        if self.automation.max_parallel_messages == 0 || self.automation.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "automation parallelism and batch size must be at least 1".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account id {}",
                    account.id
                )));
            }
            if account.folders.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account {} watches no folders",
                    account.email_address
                )));
            }
        }

        Ok(())
    }

    pub fn account(&self, id: Uuid) -> Option<&AccountConfig> {
        self.accounts.iter().find(|account| account.id == id)
    }
}

fn default_true() -> bool {
    true
}

fn default_imap_port() -> u16 {
    993
}

fn default_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}
