//! PostgreSQL sink backed by sqlx.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mops_core::{
    CampaignPatch, CampaignQuery, CampaignRecord, CampaignStatus, MonthlyBudget, NewCampaign, Platform,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::store::{prepare_batch, validate_budget, CampaignStore, StoreError};

const CAMPAIGN_COLUMNS: &str = "id, external_id, platform, name, status, spend, impressions, clicks, ctr, \
     conversions, conversions_value, budget, start_date, end_date, raw_data, updated_at";

#[derive(Debug, Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool that connects on first use, so a server can start while the sink is down.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("campaign schema migrations applied");
        Ok(())
    }
}

fn to_i64(field: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Invalid(format!("{field}={value} out of range")))
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn record_from_row(row: &PgRow) -> Result<CampaignRecord, StoreError> {
    let platform_text: String = row.try_get("platform")?;
    let platform = Platform::parse(&platform_text)
        .ok_or_else(|| StoreError::Invalid(format!("unknown platform {platform_text}")))?;
    let status_text: String = row.try_get("status")?;
    Ok(CampaignRecord {
        id: Some(row.try_get::<Uuid, _>("id")?),
        external_id: row.try_get("external_id")?,
        platform,
        name: row.try_get("name")?,
        status: CampaignStatus::parse(&status_text).unwrap_or_default(),
        spend: row.try_get("spend")?,
        impressions: to_u64(row.try_get("impressions")?),
        clicks: to_u64(row.try_get("clicks")?),
        ctr: row.try_get("ctr")?,
        conversions: to_u64(row.try_get("conversions")?),
        conversions_value: row.try_get("conversions_value")?,
        budget: row.try_get::<Option<f64>, _>("budget")?,
        start_date: row.try_get::<Option<NaiveDate>, _>("start_date")?,
        end_date: row.try_get::<Option<NaiveDate>, _>("end_date")?,
        raw_data: row
            .try_get::<Option<JsonValue>, _>("raw_data")?
            .unwrap_or(JsonValue::Null),
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn budget_from_row(row: &PgRow) -> Result<MonthlyBudget, StoreError> {
    Ok(MonthlyBudget {
        month: row.try_get("month")?,
        google_budget: row.try_get("google_budget")?,
        meta_budget: row.try_get("meta_budget")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn list_campaigns(&self, query: &CampaignQuery) -> Result<Vec<CampaignRecord>, StoreError> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
              WHERE ($1::text IS NULL OR status = $1) \
                AND ($2::text IS NULL OR platform = $2) \
              ORDER BY updated_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.platform.map(|p| p.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<CampaignRecord>, StoreError> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn create_campaign(&self, campaign: NewCampaign) -> Result<CampaignRecord, StoreError> {
        let record = campaign.into_record(Utc::now());
        let sql = format!(
            "INSERT INTO campaigns (external_id, platform, name, status, budget, start_date, end_date, raw_data, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (platform, external_id) DO NOTHING \
             RETURNING {CAMPAIGN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&record.external_id)
            .bind(record.platform.as_str())
            .bind(&record.name)
            .bind(record.status.as_str())
            .bind(record.budget)
            .bind(record.start_date)
            .bind(record.end_date)
            .bind(&record.raw_data)
            .bind(record.updated_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::Conflict {
                platform: record.platform,
                external_id: record.external_id,
            }),
        }
    }

    async fn update_campaign(&self, id: Uuid, patch: &CampaignPatch) -> Result<CampaignRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let select = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let mut record = record_from_row(&row)?;
        patch.apply(&mut record, Utc::now());

        let update = format!(
            "UPDATE campaigns SET name = $2, status = $3, budget = $4, start_date = $5, end_date = $6, \
                    spend = $7, impressions = $8, clicks = $9, ctr = $10, conversions = $11, \
                    conversions_value = $12, updated_at = $13, raw_data = $14 \
              WHERE id = $1 \
              RETURNING {CAMPAIGN_COLUMNS}"
        );
        let row = sqlx::query(&update)
            .bind(id)
            .bind(&record.name)
            .bind(record.status.as_str())
            .bind(record.budget)
            .bind(record.start_date)
            .bind(record.end_date)
            .bind(record.spend)
            .bind(to_i64("impressions", record.impressions)?)
            .bind(to_i64("clicks", record.clicks)?)
            .bind(record.ctr)
            .bind(to_i64("conversions", record.conversions)?)
            .bind(record.conversions_value)
            .bind(record.updated_at)
            .bind(&record.raw_data)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        record_from_row(&row)
    }

    async fn delete_campaign(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn upsert_campaigns(&self, records: &[CampaignRecord]) -> Result<Vec<CampaignRecord>, StoreError> {
        let batch = prepare_batch(records)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO campaigns (external_id, platform, name, status, spend, impressions, clicks, ctr, \
                                    conversions, conversions_value, budget, start_date, end_date, raw_data, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             ON CONFLICT (platform, external_id) DO UPDATE SET \
                name = EXCLUDED.name, \
                status = EXCLUDED.status, \
                spend = EXCLUDED.spend, \
                impressions = EXCLUDED.impressions, \
                clicks = EXCLUDED.clicks, \
                ctr = EXCLUDED.ctr, \
                conversions = EXCLUDED.conversions, \
                conversions_value = EXCLUDED.conversions_value, \
                budget = COALESCE(EXCLUDED.budget, campaigns.budget), \
                start_date = EXCLUDED.start_date, \
                end_date = EXCLUDED.end_date, \
                raw_data = EXCLUDED.raw_data, \
                updated_at = EXCLUDED.updated_at \
             RETURNING {CAMPAIGN_COLUMNS}"
        );

        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(batch.len());
        for record in &batch {
            let row = sqlx::query(&sql)
                .bind(&record.external_id)
                .bind(record.platform.as_str())
                .bind(&record.name)
                .bind(record.status.as_str())
                .bind(record.spend)
                .bind(to_i64("impressions", record.impressions)?)
                .bind(to_i64("clicks", record.clicks)?)
                .bind(record.ctr)
                .bind(to_i64("conversions", record.conversions)?)
                .bind(record.conversions_value)
                .bind(record.budget)
                .bind(record.start_date)
                .bind(record.end_date)
                .bind(&record.raw_data)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
            written.push(record_from_row(&row)?);
        }
        tx.commit().await?;
        info!(rows = written.len(), "campaign batch upserted");
        Ok(written)
    }

    async fn monthly_budget(&self, month: &str) -> Result<Option<MonthlyBudget>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT month, google_budget, meta_budget, updated_at
              FROM monthly_budgets
             WHERE month = $1
            "#,
        )
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(budget_from_row).transpose()
    }

    async fn upsert_monthly_budget(&self, budget: &MonthlyBudget) -> Result<MonthlyBudget, StoreError> {
        validate_budget(budget)?;
        let row = sqlx::query(
            r#"
            INSERT INTO monthly_budgets (month, google_budget, meta_budget, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (month) DO UPDATE SET
                google_budget = EXCLUDED.google_budget,
                meta_budget = EXCLUDED.meta_budget,
                updated_at = EXCLUDED.updated_at
            RETURNING month, google_budget, meta_budget, updated_at
            "#,
        )
        .bind(&budget.month)
        .bind(budget.google_budget)
        .bind(budget.meta_budget)
        .fetch_one(&self.pool)
        .await?;
        budget_from_row(&row)
    }
}
