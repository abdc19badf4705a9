//! Meta Graph API campaign/insights adapter.

use async_trait::async_trait;
use mops_core::payload::MetaAdsRaw;
use mops_core::{Platform, RawCampaign};
use mops_storage::{FetchError, HttpFetcher};
use serde_json::{json, Value as JsonValue};

use crate::{non_empty, AdapterContext, AdapterError, AdsProvider, DateWindow, ProviderFetch, SyncLog, PAGE_SIZE};

pub const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";

const MISSING_CREDENTIALS: &str = "Missing META_ACCESS_TOKEN or META_ACCOUNT_ID environment variables";
const CAMPAIGN_FIELDS: &str = "id,name,status,start_time,stop_time,\
     insights{impressions,clicks,spend,ctr,cpc,cpm,reach,frequency,actions,action_values}";

#[derive(Clone, PartialEq, Eq)]
pub struct MetaAdsCredentials {
    pub access_token: String,
    /// Ad account id, `act_` prefixed.
    pub account_id: String,
}

impl std::fmt::Debug for MetaAdsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaAdsCredentials")
            .field("access_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl MetaAdsCredentials {
    pub fn from_parts(access_token: Option<String>, account_id: Option<String>) -> Option<Self> {
        let account_id = non_empty(account_id)?;
        let account_id = if account_id.starts_with("act_") {
            account_id
        } else {
            format!("act_{account_id}")
        };
        Some(Self {
            access_token: non_empty(access_token)?,
            account_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MetaAdsAdapter {
    credentials: Option<MetaAdsCredentials>,
    graph_base: String,
}

/// Query parameters for the campaigns edge, access token excluded.
pub fn campaign_query_params(window: Option<&DateWindow>) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("fields", CAMPAIGN_FIELDS.to_string()),
        ("limit", PAGE_SIZE.to_string()),
        ("sort", "updated_time_descending".to_string()),
    ];
    match window {
        Some(window) => params.push((
            "time_range",
            json!({
                "since": window.start.format("%Y-%m-%d").to_string(),
                "until": window.end.format("%Y-%m-%d").to_string(),
            })
            .to_string(),
        )),
        None => params.push(("date_preset", "maximum".to_string())),
    }
    params
}

pub fn parse_meta_campaigns_response(body: &JsonValue) -> Vec<RawCampaign> {
    body.get("data")
        .and_then(JsonValue::as_array)
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(MetaAdsRaw::from_graph_node)
                .map(RawCampaign::MetaAds)
                .collect()
        })
        .unwrap_or_default()
}

impl MetaAdsAdapter {
    pub fn new(credentials: Option<MetaAdsCredentials>, graph_base: &str) -> Self {
        Self {
            credentials,
            graph_base: graph_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AdsProvider for MetaAdsAdapter {
    fn platform(&self) -> Platform {
        Platform::MetaAds
    }

    async fn fetch_campaigns(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        window: Option<DateWindow>,
        log: &mut SyncLog,
    ) -> Result<ProviderFetch, AdapterError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or(AdapterError::MissingCredentials(MISSING_CREDENTIALS))?;
        log.info(format!("Context: account {}", creds.account_id));

        match &window {
            Some(w) => log.info(format!("Time filter: {} to {}", w.start, w.end)),
            None => log.info("Time filter: date_preset=maximum"),
        }
        let url = format!("{}/{}/campaigns", self.graph_base, creds.account_id);
        let params = campaign_query_params(window.as_ref());

        log.info("Querying Meta Graph API...");
        // The token rides in the query string, so neither error path may carry the URL.
        let resp = http
            .execute(ctx.run_id, Platform::MetaAds, |client| {
                client
                    .get(&url)
                    .query(&params)
                    .query(&[("access_token", creds.access_token.as_str())])
            })
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, body, .. } => AdapterError::Api {
                    provider: "Meta",
                    status,
                    body,
                },
                FetchError::Request(err) => AdapterError::Fetch(FetchError::Request(err.without_url())),
                FetchError::Decode { message, .. } => AdapterError::Fetch(FetchError::Decode {
                    url: url.clone(),
                    message,
                }),
                other => AdapterError::Fetch(other),
            })?;

        let body = resp.json().map_err(|err| match err {
            FetchError::Decode { message, .. } => AdapterError::Fetch(FetchError::Decode {
                url: url.clone(),
                message,
            }),
            other => AdapterError::Fetch(other),
        })?;
        let campaigns = parse_meta_campaigns_response(&body);
        log.info(format!("Found {} campaigns.", campaigns.len()));
        Ok(ProviderFetch {
            campaigns,
            raw_body: Some(resp.body),
        })
    }
}
