use crate::{EmailError, FolderStatus, MailboxClient};
use std::sync::{Arc, Mutex};
use tokio::task;
use uuid::Uuid;

/// One account's protocol session. Commands from concurrent callers queue on
/// the mutex and run one at a time on the blocking pool.
#[derive(Clone)]
pub struct MailboxSession {
    account_id: Uuid,
    client: Arc<Mutex<Box<dyn MailboxClient>>>,
}

impl std::fmt::Debug for MailboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxSession")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

impl MailboxSession {
    pub fn new(account_id: Uuid, client: Box<dyn MailboxClient>) -> Self {
        Self {
            account_id,
            client: Arc::new(Mutex::new(client)),
        }
    }

    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    pub async fn run<T, F>(&self, op: F) -> Result<T, EmailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn MailboxClient) -> Result<T, EmailError> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        task::spawn_blocking(move || {
            let mut guard = client
                .lock()
                .map_err(|_| EmailError::Protocol("mailbox session poisoned".to_string()))?;
            op(&mut **guard)
        })
        .await
        .map_err(|err| EmailError::Protocol(format!("mailbox task failed: {err}")))?
    }

    /// Select `folder`, then run `op` without releasing the session in between.
    pub async fn in_folder<T, F>(&self, folder: &str, op: F) -> Result<T, EmailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn MailboxClient, FolderStatus) -> Result<T, EmailError> + Send + 'static,
    {
        let folder = folder.to_string();
        self.run(move |client| {
            let status = client.select(&folder)?;
            op(client, status)
        })
        .await
    }

    pub async fn logout(&self) {
        if let Err(err) = self.run(|client| client.logout()).await {
            tracing::debug!(account_id = %self.account_id, error = %err, "logout failed");
        }
    }
}
