mod cycle;
mod state;

use anyhow::Context;
use sift_config::ConfigManager;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let run_once = std::env::args().skip(1).any(|arg| arg == "--once");

    let manager = ConfigManager::new().context("initialize config manager")?;
    let config = manager.load().context("load app config")?;
    init_tracing(&config.logging.filter);
    tracing::info!(config = %manager.config_path().display(), "sift starting");

    let poll_interval = Duration::from_secs(config.sync.poll_interval_secs.max(1));
    let state = Arc::new(
        AppState::initialize(&manager, config)
            .await
            .context("initialize app state")?,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            on_signal.cancel();
        }
    });

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let summary = cycle::run_cycle(Arc::clone(&state), cancel.child_token()).await;
                tracing::info!(
                    completed = summary.completed_accounts,
                    failed = summary.failed_accounts,
                    retries = summary.retries,
                    folders = summary.folders_synced,
                    folder_failures = summary.folder_failures,
                    stored = summary.messages_stored,
                    degraded = summary.degraded,
                    invalidated = summary.invalidated,
                    flags_pushed = summary.flags_pushed,
                    flags_pulled = summary.flags_pulled,
                    remaps_confirmed = summary.remaps_confirmed,
                    rules_matched = summary.rules_matched,
                    action_failures = summary.action_failures,
                    cancelled = summary.cancelled,
                    "sync cycle completed"
                );
                if run_once {
                    break;
                }
            }
        }
    }

    state.storage.pool().close().await;
    tracing::info!("sift stopped");
    Ok(())
}
