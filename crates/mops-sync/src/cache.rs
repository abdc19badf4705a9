//! Owned container for the reconciled campaign collection.
//!
//! `reload` is the only writer. Readers take an `Arc` snapshot that stays valid
//! while a reload swaps in a new collection.

use std::sync::Arc;
use std::time::Duration;

use mops_core::{reconcile_all, CampaignQuery, CampaignRecord};
use mops_storage::CampaignStore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The sink could not be read. Nothing is served in its place.
    #[error("campaign data unavailable: {0}")]
    Unavailable(String),
    /// The sink answered with zero campaigns.
    #[error("no campaign data found")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DataHealth {
    pub rows: usize,
    pub total_impressions: u64,
    pub total_spend: f64,
    pub has_stats: bool,
}

impl DataHealth {
    pub fn of(records: &[CampaignRecord]) -> Self {
        let total_impressions = records
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.impressions));
        let total_spend = records.iter().map(|r| r.spend).sum();
        Self {
            rows: records.len(),
            total_impressions,
            total_spend,
            has_stats: total_impressions > 0 || total_spend > 0.0,
        }
    }
}

/// Retry schedule for reading back freshly synced data.
#[derive(Debug, Clone, Copy)]
pub struct ReloadPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Records and the health computed from them always change together.
#[derive(Debug, Default)]
struct CacheState {
    records: Arc<Vec<CampaignRecord>>,
    health: Option<DataHealth>,
    /// Why the last read failed; cleared by the next successful one.
    failure: Option<String>,
}

pub struct CampaignCache {
    store: Arc<dyn CampaignStore>,
    state: RwLock<CacheState>,
    policy: ReloadPolicy,
}

impl CampaignCache {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self {
            store,
            state: RwLock::new(CacheState::default()),
            policy: ReloadPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReloadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn snapshot(&self) -> Arc<Vec<CampaignRecord>> {
        self.state.read().await.records.clone()
    }

    /// Health of the last successful read, `None` before the first one or
    /// after a failed one.
    pub async fn health(&self) -> Option<DataHealth> {
        self.state.read().await.health
    }

    /// Error from the last read, if it failed.
    pub async fn last_failure(&self) -> Option<String> {
        self.state.read().await.failure.clone()
    }

    /// True when nothing trustworthy is held: never loaded, or the last read failed.
    pub async fn needs_reload(&self) -> bool {
        let state = self.state.read().await;
        state.health.is_none() || state.failure.is_some()
    }

    /// Drop the held collection after the sink was found unreachable elsewhere.
    pub async fn mark_unavailable(&self, reason: impl Into<String>) {
        *self.state.write().await = CacheState {
            failure: Some(reason.into()),
            ..CacheState::default()
        };
    }

    /// One full read of the sink, reconciled.
    pub async fn reload(&self) -> Result<DataHealth, LoadError> {
        let rows = match self.store.list_campaigns(&CampaignQuery::default()).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "campaign reload failed");
                self.mark_unavailable(err.to_string()).await;
                return Err(LoadError::Unavailable(err.to_string()));
            }
        };

        let records = reconcile_all(rows);
        let health = DataHealth::of(&records);
        info!(
            rows = health.rows,
            total_impressions = health.total_impressions,
            total_spend = health.total_spend,
            has_stats = health.has_stats,
            "campaign cache reloaded"
        );
        if health.rows > 0 && !health.has_stats {
            // Organic and test campaigns legitimately report nothing.
            warn!(rows = health.rows, "campaigns loaded without any spend or impressions");
        }

        *self.state.write().await = CacheState {
            records: Arc::new(records),
            health: Some(health),
            failure: None,
        };
        if health.rows == 0 {
            return Err(LoadError::Empty);
        }
        Ok(health)
    }

    /// Reload, retrying while the sink errors or returns nothing.
    pub async fn reload_after_sync(&self) -> Result<DataHealth, LoadError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.reload().await {
                Ok(health) => return Ok(health),
                Err(err) if attempt < attempts => {
                    warn!(attempt, attempts, error = %err, "retrying campaign reload");
                    tokio::time::sleep(self.policy.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
