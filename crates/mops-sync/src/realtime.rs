use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mops_storage::BackoffPolicy;
use sqlx::postgres::{PgListener, PgPool};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::CampaignCache;

/// Channel the `campaigns` trigger notifies on.
pub const CHANGE_CHANNEL: &str = "campaigns_changed";

/// Pause between listener restarts.
const LISTENER_BACKOFF: BackoffPolicy = BackoffPolicy {
    max_retries: usize::MAX,
    base_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(60),
};

/// Reload the whole cache on every change notification. Never returns while
/// the listener is healthy; `PgListener` reconnects on its own.
pub async fn listen_for_changes(pool: &PgPool, cache: Arc<CampaignCache>) -> Result<()> {
    let mut listener = PgListener::connect_with(pool)
        .await
        .context("connecting change listener")?;
    listener
        .listen(CHANGE_CHANNEL)
        .await
        .with_context(|| format!("listening on {CHANGE_CHANNEL}"))?;
    info!(channel = CHANGE_CHANNEL, "listening for campaign changes");
    // Changes made while no listener was attached were never announced.
    if let Err(err) = cache.reload().await {
        warn!(error = %err, "reload after attaching change listener failed");
    }

    loop {
        let notification = listener.recv().await.context("receiving change notification")?;
        info!(operation = notification.payload(), "campaign change notification");
        if let Err(err) = cache.reload().await {
            warn!(error = %err, "reload after change notification failed");
        }
    }
}

/// Consecutive failures after a run that lasted `ran_for`. A run that stayed
/// up longer than the longest pause starts the count over.
fn failures_after(ran_for: Duration, failures: usize) -> usize {
    if ran_for >= LISTENER_BACKOFF.max_delay {
        1
    } else {
        failures.saturating_add(1)
    }
}

/// Keep a change listener attached for the life of the process, restarting it
/// with exponential backoff whenever it fails.
pub fn spawn_change_listener(pool: PgPool, cache: Arc<CampaignCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures = 0;
        loop {
            let started = Instant::now();
            let err = match listen_for_changes(&pool, cache.clone()).await {
                Ok(()) => anyhow::anyhow!("change listener returned"),
                Err(err) => err,
            };
            failures = failures_after(started.elapsed(), failures);
            let pause = LISTENER_BACKOFF.delay(failures - 1);
            warn!(
                error = %format!("{err:#}"),
                failures,
                retry_in_ms = pause.as_millis() as u64,
                "campaign change listener stopped, restarting"
            );
            tokio::time::sleep(pause).await;
        }
    })
}
