//! Aggregation over reconciled campaign collections.
//!
//! Everything here is a pure fold over caller-supplied records. No function in
//! this module divides by zero: undefined ratios are `0.0` or `None`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::reconcile::click_through_rate;
use crate::{CampaignRecord, CampaignStatus, Platform};

/// Predicate applied before any aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub status: Option<CampaignStatus>,
    #[serde(default)]
    pub platform: Option<Platform>,
    /// Case-insensitive substring over name and external id.
    #[serde(default, alias = "q")]
    pub search: Option<String>,
    #[serde(default)]
    pub active_only: bool,
}

impl RecordFilter {
    pub fn matches(&self, record: &CampaignRecord) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.platform.is_some_and(|p| p != record.platform) {
            return false;
        }
        if self.active_only && !record.is_active() {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                let needle = needle.to_lowercase();
                record.name.to_lowercase().contains(&needle)
                    || record.external_id.to_lowercase().contains(&needle)
            }
            _ => true,
        }
    }

    pub fn apply<'a>(&self, records: &'a [CampaignRecord]) -> Vec<&'a CampaignRecord> {
        records.iter().filter(|r| self.matches(r)).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Totals {
    pub spend: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub ctr: f64,
}

pub fn totals<'a>(records: impl IntoIterator<Item = &'a CampaignRecord>) -> Totals {
    let mut out = Totals::default();
    for record in records {
        out.spend += record.spend;
        out.impressions = out.impressions.saturating_add(record.impressions);
        out.clicks = out.clicks.saturating_add(record.clicks);
    }
    out.ctr = click_through_rate(out.clicks, out.impressions);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlatformBucket {
    pub platform: Platform,
    pub spend: f64,
    pub clicks: u64,
    pub conversions: u64,
    /// `None` when the platform has no conversions.
    pub cpa: Option<f64>,
}

impl PlatformBucket {
    fn empty(platform: Platform) -> Self {
        Self {
            platform,
            spend: 0.0,
            clicks: 0,
            conversions: 0,
            cpa: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlatformSplit {
    pub google_ads: PlatformBucket,
    pub meta_ads: PlatformBucket,
    pub spend_winner: Option<Platform>,
    pub clicks_winner: Option<Platform>,
    /// Lower positive CPA wins.
    pub cpa_winner: Option<Platform>,
}

fn greater_winner(google: f64, meta: f64) -> Option<Platform> {
    match google.total_cmp(&meta) {
        Ordering::Greater if google > 0.0 => Some(Platform::GoogleAds),
        Ordering::Less if meta > 0.0 => Some(Platform::MetaAds),
        _ => None,
    }
}

fn lesser_cpa_winner(google: Option<f64>, meta: Option<f64>) -> Option<Platform> {
    let (google, meta) = (google.filter(|c| *c > 0.0)?, meta.filter(|c| *c > 0.0)?);
    match google.total_cmp(&meta) {
        Ordering::Less => Some(Platform::GoogleAds),
        Ordering::Greater => Some(Platform::MetaAds),
        Ordering::Equal => None,
    }
}

pub fn platform_split<'a>(records: impl IntoIterator<Item = &'a CampaignRecord>) -> PlatformSplit {
    let mut google = PlatformBucket::empty(Platform::GoogleAds);
    let mut meta = PlatformBucket::empty(Platform::MetaAds);
    for record in records {
        let bucket = match record.platform {
            Platform::GoogleAds => &mut google,
            Platform::MetaAds => &mut meta,
        };
        bucket.spend += record.spend;
        bucket.clicks = bucket.clicks.saturating_add(record.clicks);
        bucket.conversions = bucket.conversions.saturating_add(record.conversions);
    }
    for bucket in [&mut google, &mut meta] {
        if bucket.conversions > 0 {
            bucket.cpa = Some(bucket.spend / bucket.conversions as f64);
        }
    }
    PlatformSplit {
        spend_winner: greater_winner(google.spend, meta.spend),
        clicks_winner: greater_winner(google.clicks as f64, meta.clicks as f64),
        cpa_winner: lesser_cpa_winner(google.cpa, meta.cpa),
        google_ads: google,
        meta_ads: meta,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacingStatus {
    #[serde(rename = "On Track")]
    OnTrack,
    Watch,
    #[serde(rename = "Near Limit")]
    NearLimit,
    Overspend,
}

impl PacingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacingStatus::OnTrack => "On Track",
            PacingStatus::Watch => "Watch",
            PacingStatus::NearLimit => "Near Limit",
            PacingStatus::Overspend => "Overspend",
        }
    }
}

impl fmt::Display for PacingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overspend is checked first, so an account far ahead of day-pace and near
/// its limit reports Overspend.
pub fn classify_pacing(spend_percent: f64, day_percent: f64) -> PacingStatus {
    let variance = spend_percent - day_percent;
    if variance > 15.0 {
        PacingStatus::Overspend
    } else if variance > 5.0 {
        PacingStatus::Watch
    } else if spend_percent >= 95.0 {
        PacingStatus::NearLimit
    } else {
        PacingStatus::OnTrack
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetSource {
    Manual,
    CampaignSum,
    Floor,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetPacing {
    pub total_spend: f64,
    pub effective_budget: f64,
    pub budget_source: BudgetSource,
    pub spend_percent: f64,
    pub day_of_month: u32,
    pub days_in_month: u32,
    pub day_percent: f64,
    pub variance: f64,
    pub status: PacingStatus,
}

pub fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|next| next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

/// Pace total spend against `manual_budget` as of `as_of`.
///
/// A non-positive manual budget falls back to the sum of campaign budgets,
/// then to `1.0`.
pub fn budget_pacing(records: &[CampaignRecord], manual_budget: f64, as_of: NaiveDate) -> BudgetPacing {
    let total_spend: f64 = records.iter().map(|r| r.spend).sum();
    let campaign_budgets: f64 = records
        .iter()
        .filter_map(|r| r.budget)
        .filter(|b| b.is_finite() && *b > 0.0)
        .sum();

    let (effective_budget, budget_source) = if manual_budget.is_finite() && manual_budget > 0.0 {
        (manual_budget, BudgetSource::Manual)
    } else if campaign_budgets > 0.0 {
        (campaign_budgets, BudgetSource::CampaignSum)
    } else {
        (1.0, BudgetSource::Floor)
    };

    let days = days_in_month(as_of);
    let day_of_month = as_of.day();
    let spend_percent = total_spend / effective_budget * 100.0;
    let day_percent = day_of_month as f64 / days as f64 * 100.0;
    BudgetPacing {
        total_spend,
        effective_budget,
        budget_source,
        spend_percent,
        day_of_month,
        days_in_month: days,
        day_percent,
        variance: spend_percent - day_percent,
        status: classify_pacing(spend_percent, day_percent),
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown metric key: {0}")]
pub struct ParseMetricKeyError(pub String);

/// Sortable and rankable numeric fields of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    Spend,
    Impressions,
    Clicks,
    Ctr,
    Conversions,
    ConversionsValue,
    Budget,
}

impl MetricKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKey::Spend => "spend",
            MetricKey::Impressions => "impressions",
            MetricKey::Clicks => "clicks",
            MetricKey::Ctr => "ctr",
            MetricKey::Conversions => "conversions",
            MetricKey::ConversionsValue => "conversions_value",
            MetricKey::Budget => "budget",
        }
    }

    pub fn value(&self, record: &CampaignRecord) -> f64 {
        match self {
            MetricKey::Spend => record.spend,
            MetricKey::Impressions => record.impressions as f64,
            MetricKey::Clicks => record.clicks as f64,
            MetricKey::Ctr => click_through_rate(record.clicks, record.impressions),
            MetricKey::Conversions => record.conversions as f64,
            MetricKey::ConversionsValue => record.conversions_value,
            MetricKey::Budget => record.budget.unwrap_or(0.0),
        }
    }
}

impl FromStr for MetricKey {
    type Err = ParseMetricKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spend" => Ok(MetricKey::Spend),
            "impressions" => Ok(MetricKey::Impressions),
            "clicks" => Ok(MetricKey::Clicks),
            "ctr" => Ok(MetricKey::Ctr),
            "conversions" => Ok(MetricKey::Conversions),
            "conversions_value" | "conversionsvalue" => Ok(MetricKey::ConversionsValue),
            "budget" => Ok(MetricKey::Budget),
            _ => Err(ParseMetricKeyError(s.to_string())),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records below this many impressions are left out of CTR rankings.
pub const CTR_MIN_IMPRESSIONS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub id: Option<Uuid>,
    pub external_id: String,
    pub platform: Platform,
    pub name: String,
    pub value: f64,
}

/// Records ordered by `key`, highest first. Ties keep input order.
pub fn ranked_breakdown<'a>(
    records: impl IntoIterator<Item = &'a CampaignRecord>,
    key: MetricKey,
) -> Vec<RankedEntry> {
    let mut entries: Vec<RankedEntry> = records
        .into_iter()
        .filter(|r| key != MetricKey::Ctr || r.impressions >= CTR_MIN_IMPRESSIONS)
        .map(|r| RankedEntry {
            id: r.id,
            external_id: r.external_id.clone(),
            platform: r.platform,
            name: r.name.clone(),
            value: key.value(r),
        })
        .collect();
    entries.sort_by(|a, b| b.value.total_cmp(&a.value));
    entries
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = ParseMetricKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(ParseMetricKeyError(s.to_string())),
        }
    }
}

pub fn sort_records(records: &mut [CampaignRecord], key: MetricKey, order: SortOrder) {
    records.sort_by(|a, b| {
        let ord = key.value(a).total_cmp(&key.value(b));
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}

/// Pre-aggregated figures behind `getStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CampaignStats {
    pub total_active: usize,
    pub total_spend: f64,
    pub total_impressions: u64,
    pub total_clicks: u64,
    /// Rounded to two decimals.
    pub avg_ctr: f64,
}

pub fn campaign_stats(records: &[CampaignRecord]) -> CampaignStats {
    let sums = totals(records);
    CampaignStats {
        total_active: records.iter().filter(|r| r.is_active()).count(),
        total_spend: sums.spend,
        total_impressions: sums.impressions,
        total_clicks: sums.clicks,
        avg_ctr: (sums.ctr * 100.0).round() / 100.0,
    }
}

/// Ephemeral dashboard view over a filtered collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub record_count: usize,
    pub totals: Totals,
    pub platform_split: PlatformSplit,
}

pub fn aggregate(records: &[CampaignRecord], filter: &RecordFilter) -> AggregateSnapshot {
    let matching = filter.apply(records);
    AggregateSnapshot {
        record_count: matching.len(),
        totals: totals(matching.iter().copied()),
        platform_split: platform_split(matching.iter().copied()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rec(platform: Platform, id: &str, spend: f64, clicks: u64, impressions: u64) -> CampaignRecord {
        let mut r = CampaignRecord::new(platform, id, format!("Campaign {id}"), CampaignStatus::Active, Utc::now());
        r.spend = spend;
        r.clicks = clicks;
        r.impressions = impressions;
        r.ctr = click_through_rate(clicks, impressions);
        r
    }

    #[test]
    fn totals_sum_and_derive_ctr() {
        let records = vec![
            rec(Platform::GoogleAds, "a", 100.0, 10, 1000),
            rec(Platform::MetaAds, "b", 50.0, 5, 500),
        ];
        let t = totals(&records);
        assert_eq!(t.spend, 150.0);
        assert_eq!(t.clicks, 15);
        assert_eq!(t.impressions, 1500);
        assert_eq!(t.ctr, 1.0);
        assert_eq!(totals(std::iter::empty()), Totals::default());
    }

    #[test]
    fn oversized_counts_saturate_instead_of_overflowing() {
        let mut big = rec(Platform::MetaAds, "big", 1.0, u64::MAX - 1, u64::MAX - 1);
        big.conversions = u64::MAX - 1;
        let records = vec![big.clone(), big, rec(Platform::MetaAds, "c", 1.0, 5, 10)];

        let t = totals(&records);
        assert_eq!(t.impressions, u64::MAX);
        assert_eq!(t.clicks, u64::MAX);
        let split = platform_split(&records);
        assert_eq!(split.meta_ads.clicks, u64::MAX);
        assert_eq!(split.meta_ads.conversions, u64::MAX);
        assert_eq!(campaign_stats(&records).total_impressions, u64::MAX);
    }

    #[test]
    fn pacing_classification_boundaries() {
        assert_eq!(classify_pacing(50.0, 30.0), PacingStatus::Overspend);
        assert_eq!(classify_pacing(96.0, 94.0), PacingStatus::NearLimit);
        assert_eq!(classify_pacing(60.0, 45.0), PacingStatus::Watch);
        assert_eq!(classify_pacing(55.0, 50.0), PacingStatus::OnTrack);
        assert_eq!(classify_pacing(100.0, 80.0), PacingStatus::Overspend);
        assert_eq!(serde_json::to_value(PacingStatus::NearLimit).unwrap(), "Near Limit");
    }

    #[test]
    fn budget_pacing_falls_back_to_campaign_budgets_then_floor() {
        let as_of = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();
        let mut a = rec(Platform::GoogleAds, "a", 300.0, 0, 0);
        let mut b = rec(Platform::MetaAds, "b", 200.0, 0, 0);

        let manual = budget_pacing(&[a.clone(), b.clone()], 1000.0, as_of);
        assert_eq!(manual.budget_source, BudgetSource::Manual);
        assert_eq!(manual.spend_percent, 50.0);
        assert_eq!(manual.days_in_month, 31);
        assert_eq!(manual.status, PacingStatus::OnTrack);

        let floor = budget_pacing(&[a.clone(), b.clone()], 0.0, as_of);
        assert_eq!(floor.budget_source, BudgetSource::Floor);
        assert_eq!(floor.effective_budget, 1.0);
        assert_eq!(floor.status, PacingStatus::Overspend);

        a.budget = Some(400.0);
        b.budget = Some(600.0);
        let summed = budget_pacing(&[a, b], 0.0, as_of);
        assert_eq!(summed.budget_source, BudgetSource::CampaignSum);
        assert_eq!(summed.effective_budget, 1000.0);
    }

    #[test]
    fn days_in_month_handles_leap_years_and_december() {
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2028, 2, 3).unwrap()), 29);
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2026, 2, 3).unwrap()), 28);
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2026, 12, 31).unwrap()), 31);
    }

    #[test]
    fn platform_split_winners_require_strict_advantage() {
        let mut g = rec(Platform::GoogleAds, "g", 100.0, 20, 2000);
        g.conversions = 4;
        let mut m = rec(Platform::MetaAds, "m", 60.0, 20, 3000);
        m.conversions = 3;
        let split = platform_split(&[g.clone(), m.clone()]);
        assert_eq!(split.google_ads.cpa, Some(25.0));
        assert_eq!(split.meta_ads.cpa, Some(20.0));
        assert_eq!(split.spend_winner, Some(Platform::GoogleAds));
        assert_eq!(split.clicks_winner, None);
        assert_eq!(split.cpa_winner, Some(Platform::MetaAds));

        m.conversions = 0;
        let split = platform_split(&[g, m]);
        assert_eq!(split.meta_ads.cpa, None);
        assert_eq!(split.cpa_winner, None);

        let empty = platform_split(std::iter::empty());
        assert_eq!(empty.spend_winner, None);
        assert_eq!(empty.clicks_winner, None);
    }

    #[test]
    fn ctr_breakdown_excludes_low_volume_records() {
        let records = vec![
            rec(Platform::GoogleAds, "noise", 1.0, 50, 100),
            rec(Platform::MetaAds, "solid", 1.0, 40, 1000),
            rec(Platform::GoogleAds, "big", 1.0, 30, 5000),
        ];
        let ranked = ranked_breakdown(&records, MetricKey::Ctr);
        let ids: Vec<_> = ranked.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["solid", "big"]);
        assert_eq!(ranked[0].value, 4.0);

        let by_clicks = ranked_breakdown(&records, MetricKey::Clicks);
        assert_eq!(by_clicks[0].external_id, "noise");
        assert_eq!(by_clicks.len(), 3);
    }

    #[test]
    fn filter_and_sort_for_table_view() {
        let mut records = vec![
            rec(Platform::GoogleAds, "brand-1", 10.0, 1, 10),
            rec(Platform::MetaAds, "LEADS-2", 30.0, 3, 10),
            rec(Platform::MetaAds, "leads-3", 20.0, 2, 10),
        ];
        records[2].status = CampaignStatus::Paused;

        let filter = RecordFilter {
            search: Some("leads".into()),
            active_only: true,
            ..Default::default()
        };
        let hits: Vec<_> = filter.apply(&records).into_iter().map(|r| r.external_id.clone()).collect();
        assert_eq!(hits, vec!["LEADS-2"]);

        sort_records(&mut records, MetricKey::Spend, SortOrder::Asc);
        assert_eq!(records[0].external_id, "brand-1");
        sort_records(&mut records, MetricKey::Spend, SortOrder::Desc);
        assert_eq!(records[0].external_id, "LEADS-2");
        assert!("cpm".parse::<MetricKey>().is_err());
    }

    #[test]
    fn stats_and_snapshot() {
        let mut records = vec![
            rec(Platform::GoogleAds, "a", 10.0, 1, 3),
            rec(Platform::MetaAds, "b", 5.0, 0, 0),
        ];
        records[1].status = CampaignStatus::Paused;
        let stats = campaign_stats(&records);
        assert_eq!(stats.total_active, 1);
        assert_eq!(stats.avg_ctr, 33.33);

        let snapshot = aggregate(
            &records,
            &RecordFilter {
                platform: Some(Platform::MetaAds),
                ..Default::default()
            },
        );
        assert_eq!(snapshot.record_count, 1);
        assert_eq!(snapshot.totals.spend, 5.0);
        assert_eq!(snapshot.platform_split.spend_winner, Some(Platform::MetaAds));
    }
}
