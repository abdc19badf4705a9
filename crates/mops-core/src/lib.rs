//! Core campaign model, metric reconciliation and aggregation for the marketing ops pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod aggregate;
pub mod normalize;
pub mod payload;
pub mod reconcile;

pub use aggregate::{
    aggregate, budget_pacing, campaign_stats, classify_pacing, platform_split, ranked_breakdown,
    sort_records, totals, AggregateSnapshot, BudgetPacing, CampaignStats, MetricKey,
    PacingStatus, PlatformBucket, PlatformSplit, RankedEntry, RecordFilter, SortOrder, Totals,
};
pub use payload::{ProviderPayload, RawCampaign, RawMetric, MAX_COUNT};
pub use reconcile::{canonicalize, click_through_rate, reconcile, reconcile_all};

use crate::normalize::{pin_reported, ReportedMetrics};

pub const CRATE_NAME: &str = "mops-core";

/// Advertising platform a campaign belongs to. Serialized with the display
/// names the sink has always stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "Google Ads", alias = "GoogleAds", alias = "google-ads")]
    GoogleAds,
    #[serde(rename = "Meta Ads", alias = "MetaAds", alias = "meta-ads")]
    MetaAds,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::GoogleAds, Platform::MetaAds];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GoogleAds => "Google Ads",
            Platform::MetaAds => "Meta Ads",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Platform::GoogleAds => "google-ads",
            Platform::MetaAds => "meta-ads",
        }
    }

    /// Lenient parse accepting display names, slugs and bare vendor names.
    pub fn parse(input: &str) -> Option<Self> {
        let lower = input.trim().to_ascii_lowercase();
        if lower.contains("google") {
            Some(Platform::GoogleAds)
        } else if lower.contains("meta") || lower.contains("facebook") {
            Some(Platform::MetaAds)
        } else {
            None
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Platform {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::parse(s).ok_or_else(|| ParseEnumError {
            kind: "platform",
            value: s.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    #[default]
    Paused,
    Completed,
    Draft,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Draft => "draft",
        }
    }

    /// Google Ads vocabulary: ENABLED / PAUSED / REMOVED.
    pub fn from_google_status(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "ENABLED" => CampaignStatus::Active,
            "REMOVED" => CampaignStatus::Completed,
            _ => CampaignStatus::Paused,
        }
    }

    /// Meta Ads vocabulary: ACTIVE / PAUSED / ARCHIVED / DELETED.
    pub fn from_meta_status(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => CampaignStatus::Active,
            "ARCHIVED" | "DELETED" => CampaignStatus::Completed,
            _ => CampaignStatus::Paused,
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "active" | "enabled" | "on" => Some(CampaignStatus::Active),
            "paused" => Some(CampaignStatus::Paused),
            "completed" | "removed" | "archived" | "deleted" => Some(CampaignStatus::Completed),
            "draft" => Some(CampaignStatus::Draft),
            _ => None,
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CampaignStatus::parse(s).ok_or_else(|| ParseEnumError {
            kind: "campaign status",
            value: s.to_string(),
        })
    }
}

/// Canonical, unit-normalized campaign row shared by ingestion and every read path.
///
/// `(platform, external_id)` is the upsert key. `id` is assigned by the sink and
/// is `None` for rows that have not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRecord {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub external_id: String,
    pub platform: Platform,
    pub name: String,
    pub status: CampaignStatus,
    /// Whole currency units, never micros.
    pub spend: f64,
    pub impressions: u64,
    pub clicks: u64,
    /// Percentage as a number, derived from clicks and impressions.
    pub ctr: f64,
    pub conversions: u64,
    pub conversions_value: f64,
    pub budget: Option<f64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Provider payload retained for read-time repair.
    #[serde(default)]
    pub raw_data: JsonValue,
    pub updated_at: DateTime<Utc>,
}

impl CampaignRecord {
    pub fn new(
        platform: Platform,
        external_id: impl Into<String>,
        name: impl Into<String>,
        status: CampaignStatus,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            external_id: external_id.into(),
            platform,
            name: name.into(),
            status,
            spend: 0.0,
            impressions: 0,
            clicks: 0,
            ctr: 0.0,
            conversions: 0,
            conversions_value: 0.0,
            budget: None,
            start_date: None,
            end_date: None,
            raw_data: JsonValue::Null,
            updated_at,
        }
    }

    pub fn upsert_key(&self) -> (Platform, &str) {
        (self.platform, self.external_id.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }
}

/// Sink-side filter for the `getAll` read operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignQuery {
    #[serde(default)]
    pub status: Option<CampaignStatus>,
    #[serde(default)]
    pub platform: Option<Platform>,
}

impl CampaignQuery {
    pub fn matches(&self, record: &CampaignRecord) -> bool {
        self.status.map_or(true, |s| s == record.status)
            && self.platform.map_or(true, |p| p == record.platform)
    }
}

/// Manually created campaign (the `create` read-API operation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCampaign {
    #[serde(default)]
    pub external_id: Option<String>,
    pub platform: Platform,
    pub name: String,
    #[serde(default)]
    pub status: Option<CampaignStatus>,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl NewCampaign {
    pub fn into_record(self, now: DateTime<Utc>) -> CampaignRecord {
        let external_id = self
            .external_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("manual-{}", Uuid::new_v4()));
        let mut record = CampaignRecord::new(
            self.platform,
            external_id,
            self.name,
            self.status.unwrap_or(CampaignStatus::Draft),
            now,
        );
        record.budget = self.budget.filter(|b| b.is_finite() && *b >= 0.0);
        record.start_date = self.start_date;
        record.end_date = self.end_date;
        record
    }
}

/// Partial update. Identity fields are deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<CampaignStatus>,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub spend: Option<f64>,
    #[serde(default)]
    pub impressions: Option<u64>,
    #[serde(default)]
    pub clicks: Option<u64>,
    #[serde(default)]
    pub conversions: Option<u64>,
    #[serde(default)]
    pub conversions_value: Option<f64>,
}

impl CampaignPatch {
    /// Metric fields that survive validation, as the payload would report them.
    fn pinned_metrics(&self) -> ReportedMetrics {
        let valid = |v: &f64| v.is_finite() && *v >= 0.0;
        ReportedMetrics {
            spend: self.spend.filter(valid),
            impressions: self.impressions.map(|v| v.min(MAX_COUNT)),
            clicks: self.clicks.map(|v| v.min(MAX_COUNT)),
            conversions: self.conversions.map(|v| v.min(MAX_COUNT)),
            conversions_value: self.conversions_value.filter(valid),
        }
    }

    /// Apply the patch. Patched metrics are also written into `raw_data`, so
    /// reconciliation reads them back instead of the provider's figures until
    /// the next sync of the campaign replaces `raw_data`.
    pub fn apply(&self, record: &mut CampaignRecord, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(budget) = self.budget.filter(|b| b.is_finite() && *b >= 0.0) {
            record.budget = Some(budget);
        }
        if self.start_date.is_some() {
            record.start_date = self.start_date;
        }
        if self.end_date.is_some() {
            record.end_date = self.end_date;
        }

        let pinned = self.pinned_metrics();
        if let Some(spend) = pinned.spend {
            record.spend = spend;
        }
        if let Some(impressions) = pinned.impressions {
            record.impressions = impressions;
        }
        if let Some(clicks) = pinned.clicks {
            record.clicks = clicks;
        }
        if let Some(conversions) = pinned.conversions {
            record.conversions = conversions;
        }
        if let Some(value) = pinned.conversions_value {
            record.conversions_value = value;
        }
        if pinned != ReportedMetrics::default() && !record.raw_data.is_null() {
            let mut payload = ProviderPayload::from_raw_data(record.platform, &record.raw_data);
            pin_reported(&mut payload, &pinned);
            record.raw_data = payload.to_raw_data();
        }
        record.ctr = click_through_rate(record.clicks, record.impressions);
        record.updated_at = now;
    }
}

/// Manually configured budget for one calendar month (`YYYY-MM`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyBudget {
    pub month: String,
    #[serde(default)]
    pub google_budget: f64,
    #[serde(default)]
    pub meta_budget: f64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MonthlyBudget {
    pub fn total(&self) -> f64 {
        let clean = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        clean(self.google_budget) + clean(self.meta_budget)
    }

    pub fn is_valid_month(month: &str) -> bool {
        NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").is_ok() && month.len() == 7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_vocabularies_map_to_canonical_status() {
        assert_eq!(CampaignStatus::from_google_status("ENABLED"), CampaignStatus::Active);
        assert_eq!(CampaignStatus::from_google_status("PAUSED"), CampaignStatus::Paused);
        assert_eq!(CampaignStatus::from_google_status("REMOVED"), CampaignStatus::Completed);
        assert_eq!(CampaignStatus::from_google_status("UNKNOWN"), CampaignStatus::Paused);
        assert_eq!(CampaignStatus::from_meta_status("active"), CampaignStatus::Active);
        assert_eq!(CampaignStatus::from_meta_status("ARCHIVED"), CampaignStatus::Completed);
        assert_eq!(CampaignStatus::from_meta_status("DELETED"), CampaignStatus::Completed);
        assert_eq!(CampaignStatus::from_meta_status("IN_PROCESS"), CampaignStatus::Paused);
    }

    #[test]
    fn platform_serializes_with_display_names() {
        let json = serde_json::to_string(&Platform::GoogleAds).unwrap();
        assert_eq!(json, "\"Google Ads\"");
        let parsed: Platform = serde_json::from_str("\"Meta Ads\"").unwrap();
        assert_eq!(parsed, Platform::MetaAds);
        assert_eq!("google".parse::<Platform>().unwrap(), Platform::GoogleAds);
        assert!("tiktok".parse::<Platform>().is_err());
    }

    #[test]
    fn manual_campaign_defaults_to_draft_with_generated_external_id() {
        let now = Utc::now();
        let record = NewCampaign {
            external_id: None,
            platform: Platform::MetaAds,
            name: "Spring launch".into(),
            status: None,
            budget: Some(1500.0),
            start_date: None,
            end_date: None,
        }
        .into_record(now);
        assert_eq!(record.status, CampaignStatus::Draft);
        assert!(record.external_id.starts_with("manual-"));
        assert_eq!(record.budget, Some(1500.0));
        assert!(record.id.is_none());
    }

    #[test]
    fn patch_recomputes_ctr_and_ignores_invalid_numbers() {
        let now = Utc::now();
        let mut record =
            CampaignRecord::new(Platform::GoogleAds, "42", "Search", CampaignStatus::Active, now);
        CampaignPatch {
            impressions: Some(400),
            clicks: Some(8),
            spend: Some(f64::NAN),
            ..Default::default()
        }
        .apply(&mut record, now);
        assert_eq!(record.ctr, 2.0);
        assert_eq!(record.spend, 0.0);
        assert_eq!(record.external_id, "42");
    }

    #[test]
    fn patched_metrics_survive_reconcile_of_synced_rows() {
        let now = Utc::now();
        let mut meta = CampaignRecord::new(Platform::MetaAds, "7", "Leads", CampaignStatus::Active, now);
        meta.raw_data = serde_json::json!({
            "meta_status": "ACTIVE",
            "insights": {"spend": "0", "clicks": "4", "cpc": "2.5", "impressions": "100",
                "actions": [{"action_type": "lead", "value": "2"}]}
        });
        let mut meta = reconcile(meta);
        assert_eq!(meta.spend, 10.0);

        CampaignPatch {
            spend: Some(0.0),
            clicks: Some(20),
            conversions: Some(5),
            ..Default::default()
        }
        .apply(&mut meta, now);
        let meta = reconcile(meta);
        assert_eq!((meta.spend, meta.clicks, meta.impressions), (0.0, 20, 100));
        assert_eq!(meta.conversions, 5);
        assert_eq!(meta.ctr, 20.0);
        assert_eq!(meta.raw_data["meta_status"], "ACTIVE");

        let mut google = CampaignRecord::new(Platform::GoogleAds, "8", "Search", CampaignStatus::Active, now);
        google.raw_data = serde_json::json!({"metrics": {"cost_micros": "5250000", "impressions": "300", "conversionsValue": 9.5}});
        let mut google = reconcile(google);
        CampaignPatch {
            spend: Some(12.34),
            conversions_value: Some(40.0),
            ..Default::default()
        }
        .apply(&mut google, now);
        let google = reconcile(google);
        assert_eq!(google.spend, 12.34);
        assert_eq!(google.conversions_value, 40.0);
        assert_eq!(google.impressions, 300);
    }

    #[test]
    fn monthly_budget_month_validation() {
        assert!(MonthlyBudget::is_valid_month("2026-10"));
        assert!(!MonthlyBudget::is_valid_month("2026-13"));
        assert!(!MonthlyBudget::is_valid_month("2026-1"));
        let budget = MonthlyBudget {
            month: "2026-10".into(),
            google_budget: 1000.0,
            meta_budget: -5.0,
            updated_at: None,
        };
        assert_eq!(budget.total(), 1000.0);
    }
}
