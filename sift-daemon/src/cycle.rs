use crate::state::AppState;
use anyhow::Context;
use sift_config::{AccountConfig, SyncConfig};
use sift_email::{
    EmailError, FlagSynchronizer, FolderSync, ImapClient, ImapSettings, MailboxClient,
    MailboxSession, MoveReconciler,
};
use sift_rules::RuleEngine;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub completed_accounts: usize,
    pub failed_accounts: usize,
    pub retries: u32,
    pub folders_synced: usize,
    pub folder_failures: usize,
    pub messages_stored: usize,
    pub degraded: usize,
    pub invalidated: u64,
    pub flags_pushed: usize,
    pub flags_pulled: usize,
    pub remaps_confirmed: usize,
    pub rules_matched: u64,
    pub action_failures: u64,
    pub cancelled: bool,
}

impl CycleSummary {
    fn merge(&mut self, other: CycleSummary) {
        self.completed_accounts += other.completed_accounts;
        self.failed_accounts += other.failed_accounts;
        self.retries += other.retries;
        self.folders_synced += other.folders_synced;
        self.folder_failures += other.folder_failures;
        self.messages_stored += other.messages_stored;
        self.degraded += other.degraded;
        self.invalidated += other.invalidated;
        self.flags_pushed += other.flags_pushed;
        self.flags_pulled += other.flags_pulled;
        self.remaps_confirmed += other.remaps_confirmed;
        self.rules_matched += other.rules_matched;
        self.action_failures += other.action_failures;
        self.cancelled |= other.cancelled;
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    fn from_config(sync: &SyncConfig) -> Self {
        Self {
            attempts: sync.retry_attempts,
            base_delay: Duration::from_millis(sync.retry_base_delay_ms),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1_u32 << attempt.min(8))
    }

    /// Run `op` until it succeeds, fails with a non-protocol error or runs
    /// out of attempts. Returns the value and how many retries it took.
    async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<(T, u32), EmailError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EmailError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if err.is_protocol() && attempt < self.attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after protocol error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// One pass over every configured account with bounded parallelism.
pub async fn run_cycle(state: Arc<AppState>, cancel: CancellationToken) -> CycleSummary {
    let limit = Arc::new(Semaphore::new(state.config.sync.max_parallel_accounts.max(1)));
    let mut workers = JoinSet::new();

    for account in state.config.accounts.clone() {
        let state = Arc::clone(&state);
        let limit = Arc::clone(&limit);
        let cancel = cancel.clone();
        workers.spawn(async move {
            let _permit = match limit.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return (account, Err(anyhow::anyhow!("account limiter closed"))),
            };
            let result = run_account(&state, &account, &cancel).await;
            (account, result)
        });
    }

    let mut summary = CycleSummary::default();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((_, Ok(account_summary))) => {
                summary.merge(account_summary);
                summary.completed_accounts += 1;
            }
            Ok((account, Err(err))) => {
                summary.failed_accounts += 1;
                tracing::error!(
                    account = %account.email_address,
                    error = format!("{err:#}"),
                    "account cycle failed"
                );
            }
            Err(err) => {
                summary.failed_accounts += 1;
                tracing::error!(error = %err, "account worker panicked");
            }
        }
    }
    summary.cancelled |= cancel.is_cancelled();
    summary
}

/// Opens a protocol client for one account. Called again whenever the
/// current connection has failed.
trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn MailboxClient>, EmailError>;
}

struct ImapConnector(ImapSettings);

impl Connector for ImapConnector {
    fn connect(&self) -> Result<Box<dyn MailboxClient>, EmailError> {
        Ok(Box::new(ImapClient::connect(&self.0)?))
    }
}

async fn open_client(
    connector: &Arc<dyn Connector>,
    retry: RetryPolicy,
) -> Result<(Box<dyn MailboxClient>, u32), EmailError> {
    retry
        .run("connect", || {
            let connector = Arc::clone(connector);
            async move {
                tokio::task::spawn_blocking(move || connector.connect())
                    .await
                    .map_err(|err| EmailError::Protocol(format!("connect task failed: {err}")))?
            }
        })
        .await
}

/// An account's current session. A protocol error usually means the
/// connection is gone, so it is replaced before the next attempt.
struct AccountLink {
    account_id: Uuid,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    session: MailboxSession,
}

impl AccountLink {
    async fn open(
        account_id: Uuid,
        connector: Arc<dyn Connector>,
        retry: RetryPolicy,
    ) -> Result<(Self, u32), EmailError> {
        let (client, retries) = open_client(&connector, retry).await?;
        let link = Self {
            account_id,
            connector,
            retry,
            session: MailboxSession::new(account_id, client),
        };
        Ok((link, retries))
    }

    fn session(&self) -> MailboxSession {
        self.session.clone()
    }

    async fn reconnect(&mut self) -> Result<u32, EmailError> {
        let (client, retries) = open_client(&self.connector, self.retry).await?;
        self.session = MailboxSession::new(self.account_id, client);
        tracing::info!(account_id = %self.account_id, "reconnected");
        Ok(retries)
    }

    /// [`RetryPolicy::run`] with a fresh session for every retry.
    async fn run<T, F, Fut>(&mut self, what: &str, mut op: F) -> Result<(T, u32), EmailError>
    where
        F: FnMut(MailboxSession) -> Fut,
        Fut: Future<Output = Result<T, EmailError>>,
    {
        let mut attempt = 0;
        let mut retries = 0;
        loop {
            match op(self.session()).await {
                Ok(value) => return Ok((value, retries)),
                Err(err) if err.is_protocol() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "reconnecting after protocol error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    retries += 1 + self.reconnect().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn run_account(
    state: &AppState,
    account: &AccountConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<CycleSummary> {
    let settings = ImapSettings {
        host: account.imap_host.clone(),
        port: account.imap_port,
        username: account.username.clone(),
        password: state.account_password(account.id)?,
    };
    sync_account(state, account, Arc::new(ImapConnector(settings)), cancel).await
}

async fn sync_account(
    state: &AppState,
    account: &AccountConfig,
    connector: Arc<dyn Connector>,
    cancel: &CancellationToken,
) -> anyhow::Result<CycleSummary> {
    let config = &state.config;
    let retry = RetryPolicy::from_config(&config.sync);
    let mut summary = CycleSummary::default();

    let (mut link, retries) = AccountLink::open(account.id, connector, retry)
        .await
        .with_context(|| format!("connect to {}:{}", account.imap_host, account.imap_port))?;
    summary.retries += retries;

    for folder in &account.folders {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        let synced = link
            .run("sync folder", |session| {
                let sync = FolderSync::new(
                    state.storage.clone(),
                    session,
                    Arc::clone(&state.cipher),
                    config.sync.fetch_batch_size,
                );
                async move { sync.sync_folder(account.id, folder, cancel).await }
            })
            .await;
        match synced {
            Ok((report, retries)) => {
                summary.retries += retries;
                summary.folders_synced += 1;
                summary.messages_stored += report.stored;
                summary.degraded += report.degraded;
                summary.invalidated += report.invalidated;
                summary.cancelled |= report.cancelled;
            }
            Err(err) => {
                summary.folder_failures += 1;
                tracing::error!(account = %account.email_address, folder = %folder, error = %err, "folder sync failed");
                continue;
            }
        }

        if !config.sync.flag_resync || cancel.is_cancelled() {
            continue;
        }
        let Some(cursor) = state.storage.get_cursor(account.id, folder).await? else {
            continue;
        };
        let uidvalidity = cursor.uidvalidity;
        let reconciled = link
            .run("reconcile flags", |session| {
                let flags = FlagSynchronizer::new(state.storage.clone(), session);
                async move {
                    flags
                        .reconcile_folder(
                            account.id,
                            folder,
                            uidvalidity,
                            config.sync.fetch_batch_size,
                        )
                        .await
                }
            })
            .await;
        match reconciled {
            Ok((report, retries)) => {
                summary.retries += retries;
                summary.flags_pushed += report.pushed;
                summary.flags_pulled += report.pulled;
            }
            Err(err) => {
                tracing::error!(account = %account.email_address, folder = %folder, error = %err, "flag reconcile failed");
            }
        }
    }

    let swept = link
        .run("sweep moves", |session| {
            let moves = MoveReconciler::new(
                state.storage.clone(),
                session,
                account.trash_folder.clone(),
            );
            async move { moves.sweep_unconfirmed(account.id).await }
        })
        .await;
    match swept {
        Ok((report, retries)) => {
            summary.retries += retries;
            summary.remaps_confirmed += report.confirmed;
        }
        Err(err) => {
            tracing::warn!(account = %account.email_address, error = %err, "unconfirmed sweep failed");
        }
    }

    let session = link.session();
    if config.automation.enabled && !cancel.is_cancelled() {
        let engine = RuleEngine::new(
            state.storage.clone(),
            session.clone(),
            Arc::clone(&state.cipher),
            Arc::clone(&state.tags),
            account.trash_folder.clone(),
            config.automation.max_parallel_messages,
        );
        let report = engine
            .process_pending(account.id, config.automation.batch_size, cancel)
            .await
            .context("run automation")?;
        summary.rules_matched += report.matched;
        summary.action_failures += report.action_failures;
        summary.cancelled |= report.cancelled;
    }

    session.logout().await;
    tracing::info!(
        account = %account.email_address,
        folders = summary.folders_synced,
        stored = summary.messages_stored,
        matched = summary.rules_matched,
        "account cycle finished"
    );
    Ok(summary)
}
