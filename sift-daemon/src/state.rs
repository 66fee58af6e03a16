use anyhow::Context;
use sift_config::{AppConfig, ConfigManager};
use sift_core::{PayloadCipher, TagService};
use sift_security::{AesGcmCipher, SecretKey, SecretStore};
use sift_storage::{Storage, StorageTagService};
use std::sync::Arc;
use uuid::Uuid;

const KEYCHAIN_SERVICE: &str = "io.sift.daemon";

pub struct AppState {
    pub(crate) config: AppConfig,
    pub(crate) storage: Storage,
    pub(crate) secrets: SecretStore,
    pub(crate) cipher: Arc<dyn PayloadCipher>,
    pub(crate) tags: Arc<dyn TagService>,
}

impl AppState {
    pub async fn initialize(manager: &ConfigManager, config: AppConfig) -> anyhow::Result<Self> {
        let secrets = SecretStore::new(KEYCHAIN_SERVICE);
        let cipher = AesGcmCipher::from_keychain(&secrets).context("load payload key")?;

        let db_path = manager.data_dir().join(&config.database.file_name);
        let storage = Storage::connect(&db_path)
            .await
            .with_context(|| format!("open database at {}", db_path.display()))?;
        tracing::info!(path = %db_path.display(), accounts = config.accounts.len(), "state ready");

        Ok(Self {
            config,
            tags: Arc::new(StorageTagService::new(storage.clone())),
            storage,
            secrets,
            cipher: Arc::new(cipher),
        })
    }

    pub(crate) fn account_password(&self, account_id: Uuid) -> anyhow::Result<String> {
        self.secrets
            .get(&SecretKey::account_password(account_id))
            .context("read account password from keychain")?
            .with_context(|| format!("no password stored for account {account_id}"))
    }
}
