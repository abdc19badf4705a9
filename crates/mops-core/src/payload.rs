//! Provider payload shapes, both as fetched and as retained in `raw_data`.
//!
//! Every numeric field is an `Option<RawMetric>`: `None` means the provider
//! omitted the field (or sent `null`), `Some` means it reported something that
//! may or may not coerce to a number. Parsing never fails; unknown or malformed
//! structure degrades to absent fields.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::Platform;

/// Largest count the pipeline carries. Counts are stored as signed 64-bit
/// integers, so anything above this is treated as malformed.
pub const MAX_COUNT: u64 = i64::MAX as u64;

/// Whole count from a non-negative float, `None` past `MAX_COUNT`.
pub fn count_from_f64(value: f64) -> Option<u64> {
    if value >= 0.0 && value < MAX_COUNT as f64 {
        Some(value as u64)
    } else {
        None
    }
}

/// A numeric value exactly as reported upstream (JSON number or numeric string).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawMetric(JsonValue);

impl RawMetric {
    /// `None` for JSON `null`, which upstream uses interchangeably with omission.
    pub fn new(value: JsonValue) -> Option<Self> {
        if value.is_null() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn from_f64(value: f64) -> Self {
        Self(json!(value))
    }

    pub fn from_count(value: u64) -> Self {
        Self(json!(value))
    }

    pub fn value(&self) -> &JsonValue {
        &self.0
    }

    /// Finite numeric value, if the raw value coerces to one.
    pub fn as_f64(&self) -> Option<f64> {
        let parsed = match &self.0 {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed.filter(|v| v.is_finite())
    }

    pub fn as_non_negative(&self) -> Option<f64> {
        self.as_f64().filter(|v| *v >= 0.0)
    }

    pub fn as_positive(&self) -> Option<f64> {
        self.as_f64().filter(|v| *v > 0.0)
    }

    /// Integer count, truncating any fractional part. Out-of-range counts
    /// such as `"1e20"` are malformed, not saturated.
    pub fn as_count(&self) -> Option<u64> {
        self.as_non_negative().and_then(|v| count_from_f64(v.trunc()))
    }

    /// Integer count, rounding to the nearest whole value.
    pub fn as_rounded_count(&self) -> Option<u64> {
        self.as_non_negative().and_then(|v| count_from_f64(v.round()))
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// First non-null value among alternative key spellings.
fn metric_at(value: &JsonValue, keys: &[&str]) -> Option<RawMetric> {
    keys.iter()
        .find_map(|key| value.get(*key).cloned().and_then(RawMetric::new))
}

/// Strings and numbers both stringify; ids arrive either way.
fn text_at(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_at_any(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| text_at(value, &[key]))
}

fn insert_metric(map: &mut Map<String, JsonValue>, key: &str, metric: &Option<RawMetric>) {
    if let Some(metric) = metric {
        map.insert(key.to_string(), metric.value().clone());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GoogleAdsMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_micros: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impressions: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clicks: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctr: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversions: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversions_value: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_cpc: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_conversion: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_impression_share: Option<RawMetric>,
}

impl GoogleAdsMetrics {
    /// Accepts both the REST camelCase spelling and the query-language snake_case one.
    pub fn from_json(value: &JsonValue) -> Self {
        Self {
            cost_micros: metric_at(value, &["costMicros", "cost_micros"]),
            impressions: metric_at(value, &["impressions"]),
            clicks: metric_at(value, &["clicks"]),
            ctr: metric_at(value, &["ctr"]),
            conversions: metric_at(value, &["conversions"]),
            conversions_value: metric_at(value, &["conversionsValue", "conversions_value"]),
            average_cpc: metric_at(value, &["averageCpc", "average_cpc"]),
            cost_per_conversion: metric_at(value, &["costPerConversion", "cost_per_conversion"]),
            search_impression_share: metric_at(
                value,
                &["searchImpressionShare", "search_impression_share"],
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoogleAdsCampaign {
    pub id: String,
    pub name: String,
    pub status: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// One row of a Google Ads `googleAds:search` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoogleAdsRaw {
    pub campaign: GoogleAdsCampaign,
    pub metrics: GoogleAdsMetrics,
}

impl GoogleAdsRaw {
    /// `None` when the row carries no campaign id; everything else is optional.
    pub fn from_search_row(row: &JsonValue) -> Option<Self> {
        let campaign = row.get("campaign")?;
        let id = text_at(campaign, &["id"])?;
        Some(Self {
            campaign: GoogleAdsCampaign {
                name: text_at(campaign, &["name"]).unwrap_or_else(|| format!("Campaign {id}")),
                id,
                status: text_at(campaign, &["status"]).unwrap_or_default(),
                start_date: text_at_any(campaign, &["startDate", "start_date"]),
                end_date: text_at_any(campaign, &["endDate", "end_date"]),
            },
            metrics: row
                .get("metrics")
                .map(GoogleAdsMetrics::from_json)
                .unwrap_or_default(),
        })
    }

    pub fn payload(&self) -> GoogleAdsPayload {
        GoogleAdsPayload {
            google_status: Some(self.campaign.status.clone()).filter(|s| !s.is_empty()),
            metrics: self.metrics.clone(),
        }
    }
}

/// Retained Google Ads `raw_data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoogleAdsPayload {
    pub google_status: Option<String>,
    pub metrics: GoogleAdsMetrics,
}

impl GoogleAdsPayload {
    pub fn from_json(value: &JsonValue) -> Self {
        let mut metrics = value
            .get("metrics")
            .filter(|m| m.is_object())
            .map(GoogleAdsMetrics::from_json)
            .unwrap_or_default();
        if metrics.cost_micros.is_none() {
            metrics.cost_micros = metric_at(value, &["cost_micros", "costMicros"]);
        }
        Self {
            google_status: text_at(value, &["google_status"]),
            metrics,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        if let Some(status) = &self.google_status {
            map.insert("google_status".into(), JsonValue::String(status.clone()));
        }
        insert_metric(&mut map, "cost_micros", &self.metrics.cost_micros);
        map.insert(
            "metrics".into(),
            serde_json::to_value(&self.metrics).unwrap_or_else(|_| json!({})),
        );
        JsonValue::Object(map)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaAction {
    pub action_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<RawMetric>,
}

fn actions_at(value: &JsonValue, key: &str) -> Option<Vec<MetaAction>> {
    let list = value.get(key)?.as_array()?;
    Some(
        list.iter()
            .filter_map(|entry| {
                Some(MetaAction {
                    action_type: text_at(entry, &["action_type"])?,
                    value: metric_at(entry, &["value"]),
                })
            })
            .collect(),
    )
}

/// Meta insight object for a campaign. Graph API sends every number as a string.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetaInsights {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impressions: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clicks: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctr: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpc: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpm: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reach: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<RawMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<MetaAction>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_values: Option<Vec<MetaAction>>,
    /// Precomputed totals found on rows written before actions were retained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversions: Option<RawMetric>,
    #[serde(rename = "conversionValue", skip_serializing_if = "Option::is_none")]
    pub conversion_value: Option<RawMetric>,
}

impl MetaInsights {
    pub fn from_json(value: &JsonValue) -> Self {
        Self {
            spend: metric_at(value, &["spend"]),
            impressions: metric_at(value, &["impressions"]),
            clicks: metric_at(value, &["clicks"]),
            ctr: metric_at(value, &["ctr"]),
            cpc: metric_at(value, &["cpc"]),
            cpm: metric_at(value, &["cpm"]),
            reach: metric_at(value, &["reach"]),
            frequency: metric_at(value, &["frequency"]),
            actions: actions_at(value, "actions"),
            action_values: actions_at(value, "action_values"),
            conversions: metric_at(value, &["conversions"]),
            conversion_value: metric_at(value, &["conversionValue", "conversion_value"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaAdsCampaign {
    pub id: String,
    pub name: String,
    pub status: String,
    pub start_time: Option<String>,
    pub stop_time: Option<String>,
}

/// One campaign node of a Meta Graph API `/campaigns` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetaAdsRaw {
    pub campaign: MetaAdsCampaign,
    pub insights: MetaInsights,
}

impl MetaAdsRaw {
    pub fn from_graph_node(node: &JsonValue) -> Option<Self> {
        let id = text_at(node, &["id"])?;
        // The insights edge is a paged list; the first entry covers the requested range.
        let insight = match node.get("insights") {
            Some(edge) if edge.get("data").is_some() => edge
                .get("data")
                .and_then(JsonValue::as_array)
                .and_then(|data| data.first())
                .map(MetaInsights::from_json)
                .unwrap_or_default(),
            Some(edge) if edge.is_object() => MetaInsights::from_json(edge),
            _ => MetaInsights::default(),
        };
        Some(Self {
            campaign: MetaAdsCampaign {
                name: text_at(node, &["name"]).unwrap_or_else(|| format!("Campaign {id}")),
                id,
                status: text_at(node, &["status"]).unwrap_or_default(),
                start_time: text_at(node, &["start_time"]),
                stop_time: text_at(node, &["stop_time"]),
            },
            insights: insight,
        })
    }

    pub fn payload(&self) -> MetaAdsPayload {
        MetaAdsPayload {
            meta_status: Some(self.campaign.status.clone()).filter(|s| !s.is_empty()),
            insights: self.insights.clone(),
        }
    }
}

/// Retained Meta Ads `raw_data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaAdsPayload {
    pub meta_status: Option<String>,
    pub insights: MetaInsights,
}

impl MetaAdsPayload {
    pub fn from_json(value: &JsonValue) -> Self {
        let insights = match value.get("insights") {
            Some(JsonValue::Array(list)) => list.first().map(MetaInsights::from_json),
            Some(obj @ JsonValue::Object(_)) => Some(MetaInsights::from_json(obj)),
            _ => None,
        };
        Self {
            meta_status: text_at(value, &["meta_status"]),
            insights: insights.unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        if let Some(status) = &self.meta_status {
            map.insert("meta_status".into(), JsonValue::String(status.clone()));
        }
        map.insert(
            "insights".into(),
            serde_json::to_value(&self.insights).unwrap_or_else(|_| json!({})),
        );
        JsonValue::Object(map)
    }
}

/// A freshly fetched upstream record: exactly one of the two known shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCampaign {
    GoogleAds(GoogleAdsRaw),
    MetaAds(MetaAdsRaw),
}

impl RawCampaign {
    pub fn platform(&self) -> Platform {
        match self {
            RawCampaign::GoogleAds(_) => Platform::GoogleAds,
            RawCampaign::MetaAds(_) => Platform::MetaAds,
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            RawCampaign::GoogleAds(raw) => &raw.campaign.id,
            RawCampaign::MetaAds(raw) => &raw.campaign.id,
        }
    }

    pub fn payload(&self) -> ProviderPayload {
        match self {
            RawCampaign::GoogleAds(raw) => ProviderPayload::GoogleAds(raw.payload()),
            RawCampaign::MetaAds(raw) => ProviderPayload::MetaAds(raw.payload()),
        }
    }
}

/// Retained `raw_data` interpreted according to the record's platform.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderPayload {
    GoogleAds(GoogleAdsPayload),
    MetaAds(MetaAdsPayload),
}

impl ProviderPayload {
    /// Never fails: an unrecognized payload yields one with every field absent.
    pub fn from_raw_data(platform: Platform, raw_data: &JsonValue) -> Self {
        match platform {
            Platform::GoogleAds => ProviderPayload::GoogleAds(GoogleAdsPayload::from_json(raw_data)),
            Platform::MetaAds => ProviderPayload::MetaAds(MetaAdsPayload::from_json(raw_data)),
        }
    }

    pub fn to_raw_data(&self) -> JsonValue {
        match self {
            ProviderPayload::GoogleAds(payload) => payload.to_json(),
            ProviderPayload::MetaAds(payload) => payload.to_json(),
        }
    }
}
