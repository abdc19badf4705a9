//! Unit normalization and spend recovery.
//!
//! Provider encodings (micro-currency integers, string-typed numbers, action
//! lists) are turned into canonical units here. Nothing in this module returns
//! an error: a field that is absent or fails coercion is reported as `None` and
//! the caller falls back to the last-known value.

use crate::payload::{MetaAction, MetaInsights, ProviderPayload, RawMetric, MAX_COUNT};

pub const MICROS_PER_UNIT: f64 = 1_000_000.0;

/// Meta action types counted as conversions.
pub const META_CONVERSION_ACTIONS: [&str; 6] = [
    "purchase",
    "lead",
    "contact",
    "schedule",
    "submit_application",
    "mobile_app_install",
];

/// Meta action types summed into the conversions value.
pub const META_CONVERSION_VALUE_ACTIONS: [&str; 2] = ["purchase_roas", "purchase"];

/// Canonical `{spend, impressions, clicks}` triple.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CanonicalUnits {
    pub spend: f64,
    pub impressions: u64,
    pub clicks: u64,
}

/// What a payload actually reports. `None` means "absent or unparseable".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReportedMetrics {
    pub spend: Option<f64>,
    pub impressions: Option<u64>,
    pub clicks: Option<u64>,
    pub conversions: Option<u64>,
    pub conversions_value: Option<f64>,
}

impl ReportedMetrics {
    /// Fill every unreported field from `prior`.
    pub fn resolve(&self, prior: CanonicalUnits) -> CanonicalUnits {
        CanonicalUnits {
            spend: self.spend.unwrap_or(prior.spend),
            impressions: self.impressions.unwrap_or(prior.impressions),
            clicks: self.clicks.unwrap_or(prior.clicks),
        }
    }
}

fn metric<T>(raw: &Option<RawMetric>, coerce: impl Fn(&RawMetric) -> Option<T>) -> Option<T> {
    raw.as_ref().and_then(coerce)
}

fn sum_actions<T: Default>(
    actions: &[MetaAction],
    allowed: &[&str],
    coerce: impl Fn(&RawMetric) -> Option<T>,
    add: impl Fn(T, T) -> T,
) -> T {
    actions
        .iter()
        .filter(|action| allowed.contains(&action.action_type.as_str()))
        .map(|action| metric(&action.value, &coerce).unwrap_or_default())
        .fold(T::default(), add)
}

pub fn meta_conversions(insights: &MetaInsights) -> Option<u64> {
    match &insights.actions {
        Some(actions) => Some(
            sum_actions(actions, &META_CONVERSION_ACTIONS, RawMetric::as_count, u64::saturating_add)
                .min(MAX_COUNT),
        ),
        None => metric(&insights.conversions, RawMetric::as_count),
    }
}

pub fn meta_conversions_value(insights: &MetaInsights) -> Option<f64> {
    match &insights.action_values {
        Some(values) => Some(sum_actions(
            values,
            &META_CONVERSION_VALUE_ACTIONS,
            RawMetric::as_non_negative,
            |acc, v| acc + v,
        ))
        .filter(|v: &f64| v.is_finite()),
        None => metric(&insights.conversion_value, RawMetric::as_non_negative),
    }
}

/// Read every canonical metric the payload carries, converting units.
pub fn reported_metrics(payload: &ProviderPayload) -> ReportedMetrics {
    match payload {
        ProviderPayload::GoogleAds(google) => {
            let m = &google.metrics;
            ReportedMetrics {
                spend: metric(&m.cost_micros, RawMetric::as_non_negative)
                    .map(|micros| micros / MICROS_PER_UNIT),
                impressions: metric(&m.impressions, RawMetric::as_count),
                clicks: metric(&m.clicks, RawMetric::as_count),
                // Google attributes fractional conversions; the canonical field is a count.
                conversions: metric(&m.conversions, RawMetric::as_rounded_count),
                conversions_value: metric(&m.conversions_value, RawMetric::as_non_negative),
            }
        }
        ProviderPayload::MetaAds(meta) => {
            let i = &meta.insights;
            ReportedMetrics {
                spend: metric(&i.spend, RawMetric::as_non_negative),
                impressions: metric(&i.impressions, RawMetric::as_count),
                clicks: metric(&i.clicks, RawMetric::as_count),
                conversions: meta_conversions(i),
                conversions_value: meta_conversions_value(i),
            }
        }
    }
}

/// Overwrite what the payload reports with `pinned`, field by field, so that
/// `reported_metrics` reads the pinned values back. Fields left `None` keep
/// whatever the provider sent. Pinned Meta spend drops CPC and CPM, which only
/// exist to recover a withheld spend.
pub fn pin_reported(payload: &mut ProviderPayload, pinned: &ReportedMetrics) {
    match payload {
        ProviderPayload::GoogleAds(google) => {
            let m = &mut google.metrics;
            if let Some(spend) = pinned.spend {
                m.cost_micros = Some(RawMetric::from_f64((spend * MICROS_PER_UNIT).round()));
            }
            if let Some(impressions) = pinned.impressions {
                m.impressions = Some(RawMetric::from_count(impressions));
            }
            if let Some(clicks) = pinned.clicks {
                m.clicks = Some(RawMetric::from_count(clicks));
            }
            if let Some(conversions) = pinned.conversions {
                m.conversions = Some(RawMetric::from_count(conversions));
            }
            if let Some(value) = pinned.conversions_value {
                m.conversions_value = Some(RawMetric::from_f64(value));
            }
        }
        ProviderPayload::MetaAds(meta) => {
            let i = &mut meta.insights;
            if let Some(spend) = pinned.spend {
                i.spend = Some(RawMetric::from_f64(spend));
                i.cpc = None;
                i.cpm = None;
            }
            if let Some(impressions) = pinned.impressions {
                i.impressions = Some(RawMetric::from_count(impressions));
            }
            if let Some(clicks) = pinned.clicks {
                i.clicks = Some(RawMetric::from_count(clicks));
            }
            if let Some(conversions) = pinned.conversions {
                i.actions = None;
                i.conversions = Some(RawMetric::from_count(conversions));
            }
            if let Some(value) = pinned.conversions_value {
                i.action_values = None;
                i.conversion_value = Some(RawMetric::from_f64(value));
            }
        }
    }
}

/// Canonical `{spend, impressions, clicks}` for a payload, keeping `prior`
/// values for anything the payload does not report.
pub fn normalize_units(payload: &ProviderPayload, prior: CanonicalUnits) -> CanonicalUnits {
    reported_metrics(payload).resolve(prior)
}

/// Derive Meta spend from secondary pricing signals when the direct figure is
/// zero or withheld. First applicable rule wins:
/// direct spend > 0, then clicks × CPC, then impressions / 1000 × CPM.
pub fn recover_spend(clicks: u64, impressions: u64, insights: &MetaInsights) -> f64 {
    if let Some(spend) = metric(&insights.spend, RawMetric::as_positive) {
        return spend;
    }
    if clicks > 0 {
        if let Some(cpc) = metric(&insights.cpc, RawMetric::as_positive) {
            return clicks as f64 * cpc;
        }
    }
    if impressions > 0 {
        if let Some(cpm) = metric(&insights.cpm, RawMetric::as_positive) {
            return (impressions as f64 / 1000.0) * cpm;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{GoogleAdsPayload, MetaAdsPayload};
    use crate::Platform;
    use serde_json::json;

    fn meta(insights: serde_json::Value) -> MetaInsights {
        MetaInsights::from_json(&insights)
    }

    #[test]
    fn google_cost_micros_become_currency_units() {
        let payload = ProviderPayload::from_raw_data(
            Platform::GoogleAds,
            &json!({"metrics": {"cost_micros": 5_250_000}}),
        );
        let units = normalize_units(&payload, CanonicalUnits::default());
        assert_eq!(units.spend, 5.25);
    }

    #[test]
    fn missing_or_malformed_counts_keep_prior_values() {
        let payload = ProviderPayload::GoogleAds(GoogleAdsPayload::from_json(&json!({
            "metrics": {"impressions": "not-a-number"}
        })));
        let prior = CanonicalUnits {
            spend: 3.0,
            impressions: 900,
            clicks: 12,
        };
        assert_eq!(normalize_units(&payload, prior), prior);

        let payload = ProviderPayload::MetaAds(MetaAdsPayload::from_json(&json!({
            "insights": {"clicks": "15"}
        })));
        let units = normalize_units(&payload, prior);
        assert_eq!(units.clicks, 15);
        assert_eq!(units.impressions, 900);
    }

    #[test]
    fn absent_everything_degrades_to_zero_without_prior() {
        let payload = ProviderPayload::from_raw_data(Platform::MetaAds, &json!(null));
        assert_eq!(
            normalize_units(&payload, CanonicalUnits::default()),
            CanonicalUnits::default()
        );
    }

    #[test]
    fn recovery_prefers_cpc_over_cpm() {
        let insights = meta(json!({"spend": "0", "clicks": "10", "cpc": "2.5", "cpm": "40", "impressions": "1000"}));
        assert_eq!(recover_spend(10, 1000, &insights), 25.0);
    }

    #[test]
    fn recovery_falls_back_to_cpm_when_clicks_are_zero() {
        let insights = meta(json!({"spend": "0", "clicks": "0", "cpm": "40", "impressions": "2000"}));
        assert_eq!(recover_spend(0, 2000, &insights), 80.0);
    }

    #[test]
    fn recovery_uses_direct_spend_and_ignores_non_positive_signals() {
        assert_eq!(recover_spend(10, 1000, &meta(json!({"spend": "12.5", "cpc": "9"}))), 12.5);
        assert_eq!(recover_spend(10, 1000, &meta(json!({"cpc": "-1", "cpm": "abc"}))), 0.0);
        assert_eq!(recover_spend(0, 0, &meta(json!({"cpc": "2", "cpm": "40"}))), 0.0);
    }

    #[test]
    fn meta_conversions_use_the_action_allow_list() {
        let insights = meta(json!({
            "actions": [
                {"action_type": "lead", "value": "4"},
                {"action_type": "purchase", "value": "2"},
                {"action_type": "link_click", "value": "99"},
                {"action_type": "contact", "value": "oops"}
            ],
            "action_values": [
                {"action_type": "purchase", "value": "120.50"},
                {"action_type": "lead", "value": "10"}
            ]
        }));
        assert_eq!(meta_conversions(&insights), Some(6));
        assert_eq!(meta_conversions_value(&insights), Some(120.5));
    }

    #[test]
    fn meta_conversions_fall_back_to_precomputed_totals() {
        let insights = meta(json!({"conversions": 7, "conversionValue": 31.5}));
        assert_eq!(meta_conversions(&insights), Some(7));
        assert_eq!(meta_conversions_value(&insights), Some(31.5));
        assert_eq!(meta_conversions(&meta(json!({}))), None);
    }
}
