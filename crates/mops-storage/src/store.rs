//! The campaign sink: trait, error type and an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use mops_core::{CampaignPatch, CampaignQuery, CampaignRecord, MonthlyBudget, NewCampaign, Platform};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("campaign store unavailable: {0}")]
    Unavailable(String),
    #[error("campaign {0} not found")]
    NotFound(Uuid),
    #[error("campaign already exists for {platform} / {external_id}")]
    Conflict {
        platform: Platform,
        external_id: String,
    },
    #[error("invalid campaign data: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// True when the sink could not be reached at all, as opposed to a rejected operation.
    pub fn is_connectivity(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Configuration(_)
            ),
            _ => false,
        }
    }
}

/// Persistence for canonical campaigns and monthly budgets.
///
/// `upsert_campaigns` is keyed on `(platform, external_id)` and is atomic per
/// batch: either every record is written or none is.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Ordered by `updated_at`, newest first.
    async fn list_campaigns(&self, query: &CampaignQuery) -> Result<Vec<CampaignRecord>, StoreError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<CampaignRecord>, StoreError>;

    async fn create_campaign(&self, campaign: NewCampaign) -> Result<CampaignRecord, StoreError>;

    async fn update_campaign(&self, id: Uuid, patch: &CampaignPatch) -> Result<CampaignRecord, StoreError>;

    async fn delete_campaign(&self, id: Uuid) -> Result<(), StoreError>;

    async fn upsert_campaigns(&self, records: &[CampaignRecord]) -> Result<Vec<CampaignRecord>, StoreError>;

    async fn monthly_budget(&self, month: &str) -> Result<Option<MonthlyBudget>, StoreError>;

    async fn upsert_monthly_budget(&self, budget: &MonthlyBudget) -> Result<MonthlyBudget, StoreError>;
}

fn check_amount(field: &str, key: (Platform, &str), value: f64) -> Result<(), StoreError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!(
            "{field}={value} for {} / {}",
            key.0, key.1
        )))
    }
}

/// Reject the whole batch if any record is malformed, and collapse repeated
/// keys so the last occurrence wins.
pub fn prepare_batch(records: &[CampaignRecord]) -> Result<Vec<CampaignRecord>, StoreError> {
    let mut by_key: BTreeMap<(Platform, String), usize> = BTreeMap::new();
    let mut out: Vec<CampaignRecord> = Vec::with_capacity(records.len());
    for record in records {
        let key = record.upsert_key();
        if key.1.trim().is_empty() {
            return Err(StoreError::Invalid(format!("empty external id on {}", key.0)));
        }
        check_amount("spend", key, record.spend)?;
        check_amount("ctr", key, record.ctr)?;
        check_amount("conversions_value", key, record.conversions_value)?;
        if let Some(budget) = record.budget {
            check_amount("budget", key, budget)?;
        }
        match by_key.get(&(key.0, key.1.to_string())) {
            Some(&idx) => out[idx] = record.clone(),
            None => {
                by_key.insert((key.0, key.1.to_string()), out.len());
                out.push(record.clone());
            }
        }
    }
    Ok(out)
}

pub fn validate_budget(budget: &MonthlyBudget) -> Result<(), StoreError> {
    if !MonthlyBudget::is_valid_month(&budget.month) {
        return Err(StoreError::Invalid(format!("month must be YYYY-MM, got {}", budget.month)));
    }
    for (field, value) in [("google_budget", budget.google_budget), ("meta_budget", budget.meta_budget)] {
        if !value.is_finite() || value < 0.0 {
            return Err(StoreError::Invalid(format!("{field}={value}")));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryState {
    campaigns: Vec<CampaignRecord>,
    budgets: BTreeMap<String, MonthlyBudget>,
}

/// In-process sink for tests and database-less runs.
#[derive(Debug, Default)]
pub struct MemoryCampaignStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a lost connection: every operation fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn list_campaigns(&self, query: &CampaignQuery) -> Result<Vec<CampaignRecord>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .campaigns
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<CampaignRecord>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.campaigns.iter().find(|r| r.id == Some(id)).cloned())
    }

    async fn create_campaign(&self, campaign: NewCampaign) -> Result<CampaignRecord, StoreError> {
        self.check()?;
        let mut record = campaign.into_record(Utc::now());
        let mut state = self.state.lock().await;
        if state
            .campaigns
            .iter()
            .any(|r| r.upsert_key() == record.upsert_key())
        {
            return Err(StoreError::Conflict {
                platform: record.platform,
                external_id: record.external_id,
            });
        }
        record.id = Some(Uuid::new_v4());
        state.campaigns.push(record.clone());
        Ok(record)
    }

    async fn update_campaign(&self, id: Uuid, patch: &CampaignPatch) -> Result<CampaignRecord, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let record = state
            .campaigns
            .iter_mut()
            .find(|r| r.id == Some(id))
            .ok_or(StoreError::NotFound(id))?;
        patch.apply(record, Utc::now());
        Ok(record.clone())
    }

    async fn delete_campaign(&self, id: Uuid) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let before = state.campaigns.len();
        state.campaigns.retain(|r| r.id != Some(id));
        if state.campaigns.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn upsert_campaigns(&self, records: &[CampaignRecord]) -> Result<Vec<CampaignRecord>, StoreError> {
        self.check()?;
        let batch = prepare_batch(records)?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut written = Vec::with_capacity(batch.len());
        for mut incoming in batch {
            incoming.updated_at = now;
            let existing = state
                .campaigns
                .iter_mut()
                .find(|r| r.upsert_key() == incoming.upsert_key());
            match existing {
                Some(row) => {
                    incoming.id = row.id;
                    incoming.budget = incoming.budget.or(row.budget);
                    *row = incoming.clone();
                }
                None => {
                    incoming.id = Some(Uuid::new_v4());
                    state.campaigns.push(incoming.clone());
                }
            }
            written.push(incoming);
        }
        Ok(written)
    }

    async fn monthly_budget(&self, month: &str) -> Result<Option<MonthlyBudget>, StoreError> {
        self.check()?;
        Ok(self.state.lock().await.budgets.get(month).cloned())
    }

    async fn upsert_monthly_budget(&self, budget: &MonthlyBudget) -> Result<MonthlyBudget, StoreError> {
        self.check()?;
        validate_budget(budget)?;
        let mut stored = budget.clone();
        stored.updated_at = Some(Utc::now());
        self.state
            .lock()
            .await
            .budgets
            .insert(stored.month.clone(), stored.clone());
        Ok(stored)
    }
}
