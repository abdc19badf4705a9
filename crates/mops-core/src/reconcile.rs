//! Metrics reconciliation.
//!
//! `reconcile` is the single repair path shared by ingestion and every read.
//! It is pure and idempotent: the output depends only on the retained
//! `raw_data` and the record's current metric values, and feeding the output
//! back in yields the same record.

use chrono::{DateTime, NaiveDate, Utc};

use crate::normalize::{recover_spend, reported_metrics, CanonicalUnits};
use crate::payload::{ProviderPayload, RawCampaign};
use crate::{CampaignRecord, CampaignStatus};

/// Click-through rate as a percentage; zero when there are no impressions.
pub fn click_through_rate(clicks: u64, impressions: u64) -> f64 {
    if impressions == 0 {
        return 0.0;
    }
    clicks as f64 * 100.0 / impressions as f64
}

fn finite_non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Normalize units, recover withheld Meta spend and recompute CTR.
/// Identity fields (`id`, `external_id`, `platform`) are never touched.
pub fn reconcile(mut record: CampaignRecord) -> CampaignRecord {
    let payload = ProviderPayload::from_raw_data(record.platform, &record.raw_data);
    let reported = reported_metrics(&payload);

    let prior = CanonicalUnits {
        spend: finite_non_negative(record.spend),
        impressions: record.impressions,
        clicks: record.clicks,
    };
    let mut units = reported.resolve(prior);

    if units.spend == 0.0 {
        if let ProviderPayload::MetaAds(meta) = &payload {
            let recovered = recover_spend(units.clicks, units.impressions, &meta.insights);
            // Nothing to recover from: the last known spend stands.
            units.spend = if recovered > 0.0 { recovered } else { prior.spend };
        }
    }

    record.spend = units.spend;
    record.impressions = units.impressions;
    record.clicks = units.clicks;
    record.ctr = click_through_rate(units.clicks, units.impressions);
    record.conversions = reported.conversions.unwrap_or(record.conversions);
    record.conversions_value = reported
        .conversions_value
        .unwrap_or_else(|| finite_non_negative(record.conversions_value));
    record.budget = record.budget.filter(|b| b.is_finite() && *b >= 0.0);
    record
}

pub fn reconcile_all(records: Vec<CampaignRecord>) -> Vec<CampaignRecord> {
    records.into_iter().map(reconcile).collect()
}

/// Leading `YYYY-MM-DD` of a provider date or timestamp.
fn date_prefix(value: Option<&str>) -> Option<NaiveDate> {
    let value = value?;
    let head = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Build the canonical record for a freshly fetched campaign, ready for upsert.
pub fn canonicalize(raw: &RawCampaign, updated_at: DateTime<Utc>) -> CampaignRecord {
    let (name, status, start, end) = match raw {
        RawCampaign::GoogleAds(google) => (
            &google.campaign.name,
            CampaignStatus::from_google_status(&google.campaign.status),
            date_prefix(google.campaign.start_date.as_deref()),
            date_prefix(google.campaign.end_date.as_deref()),
        ),
        RawCampaign::MetaAds(meta) => (
            &meta.campaign.name,
            CampaignStatus::from_meta_status(&meta.campaign.status),
            date_prefix(meta.campaign.start_time.as_deref()),
            date_prefix(meta.campaign.stop_time.as_deref()),
        ),
    };
    let mut record = CampaignRecord::new(
        raw.platform(),
        raw.external_id(),
        name.clone(),
        status,
        updated_at,
    );
    record.start_date = start;
    record.end_date = end;
    record.raw_data = raw.payload().to_raw_data();
    reconcile(record)
}
