//! Google Ads query-language reporting adapter.

use async_trait::async_trait;
use mops_core::payload::GoogleAdsRaw;
use mops_core::{Platform, RawCampaign};
use mops_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::{non_empty, AdapterContext, AdapterError, AdsProvider, DateWindow, ProviderFetch, SyncLog, PAGE_SIZE};

pub const DEFAULT_API_BASE: &str = "https://googleads.googleapis.com/v19";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const MISSING_CREDENTIALS: &str = "Missing Google Ads environment variables";
const ERROR_BODY_LIMIT: usize = 300;
const CHILD_ACCOUNT_QUERY: &str = "SELECT customer_client.id, customer_client.descriptive_name \
     FROM customer_client WHERE customer_client.manager = false LIMIT 1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleAdsCredentials {
    pub developer_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Manager (MCC) or direct customer id.
    pub customer_id: String,
}

impl GoogleAdsCredentials {
    /// `None` unless every value is present and non-blank.
    pub fn from_parts(
        developer_token: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
        refresh_token: Option<String>,
        customer_id: Option<String>,
    ) -> Option<Self> {
        Some(Self {
            developer_token: non_empty(developer_token)?,
            client_id: non_empty(client_id)?,
            client_secret: non_empty(client_secret)?,
            refresh_token: non_empty(refresh_token)?,
            customer_id: non_empty(customer_id)?.replace('-', ""),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GoogleAdsAdapter {
    credentials: Option<GoogleAdsCredentials>,
    api_base: String,
    token_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Child (non-manager) account resolved under the configured customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildAccount {
    pub id: String,
    pub descriptive_name: Option<String>,
}

enum AccountLookup {
    Child(ChildAccount),
    NoChild,
    Failed,
}

pub fn campaign_query(window: &DateWindow) -> String {
    format!(
        "SELECT campaign.id, campaign.name, campaign.status, campaign.start_date, campaign.end_date, \
         metrics.impressions, metrics.clicks, metrics.ctr, metrics.cost_micros, \
         metrics.conversions, metrics.conversions_value, metrics.average_cpc, \
         metrics.cost_per_conversion, metrics.search_impression_share \
         FROM campaign WHERE campaign.status != 'REMOVED' \
         AND segments.date BETWEEN '{}' AND '{}' \
         ORDER BY campaign.start_date DESC LIMIT {PAGE_SIZE}",
        window.start.format("%Y-%m-%d"),
        window.end.format("%Y-%m-%d"),
    )
}

/// Rows without a campaign id are dropped.
pub fn parse_google_search_response(body: &JsonValue) -> Vec<RawCampaign> {
    body.get("results")
        .and_then(JsonValue::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(GoogleAdsRaw::from_search_row)
                .map(RawCampaign::GoogleAds)
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_child_account(body: &JsonValue) -> Option<ChildAccount> {
    let node = body
        .get("results")?
        .as_array()?
        .first()?
        .get("customerClient")?;
    let id = match node.get("id")? {
        JsonValue::String(s) if !s.is_empty() => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(ChildAccount {
        id,
        descriptive_name: node
            .get("descriptiveName")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
    })
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

impl GoogleAdsAdapter {
    pub fn new(credentials: Option<GoogleAdsCredentials>, api_base: &str, token_url: &str) -> Self {
        Self {
            credentials,
            api_base: api_base.trim_end_matches('/').to_string(),
            token_url: token_url.to_string(),
        }
    }

    fn search_url(&self, customer_id: &str) -> String {
        format!("{}/customers/{customer_id}/googleAds:search", self.api_base)
    }

    async fn refresh_access_token(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        creds: &GoogleAdsCredentials,
    ) -> Result<String, AdapterError> {
        let form = [
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("refresh_token", creds.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let resp = http
            .execute(ctx.run_id, Platform::GoogleAds, |client| {
                client.post(&self.token_url).form(&form)
            })
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { body, .. } => AdapterError::TokenRefresh(body),
                other => AdapterError::Fetch(other),
            })?;

        let body = resp.json()?;
        let token: TokenResponse = serde_json::from_value(body.clone())
            .unwrap_or(TokenResponse { access_token: None });
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AdapterError::TokenRefresh(body.to_string()))
    }

    async fn resolve_child_account(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        creds: &GoogleAdsCredentials,
        access_token: &str,
    ) -> AccountLookup {
        let url = self.search_url(&creds.customer_id);
        let body = json!({ "query": CHILD_ACCOUNT_QUERY });
        let result = http
            .execute(ctx.run_id, Platform::GoogleAds, |client| {
                client
                    .post(&url)
                    .bearer_auth(access_token)
                    .header("developer-token", &creds.developer_token)
                    .json(&body)
            })
            .await;

        match result.and_then(|resp| resp.json()) {
            Ok(body) => match parse_child_account(&body) {
                Some(child) => AccountLookup::Child(child),
                None => AccountLookup::NoChild,
            },
            Err(_) => AccountLookup::Failed,
        }
    }
}

#[async_trait]
impl AdsProvider for GoogleAdsAdapter {
    fn platform(&self) -> Platform {
        Platform::GoogleAds
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
        let window = window.unwrap_or_else(|| DateWindow::google_default(ctx.fetched_at.date_naive()));

        log.info("Refreshing Google Ads access token...");
        let access_token = self.refresh_access_token(http, ctx, creds).await?;
        log.info("Token refreshed successfully.");

        log.info(format!("Resolving child account from manager {}...", creds.customer_id));
        let target_id = match self.resolve_child_account(http, ctx, creds, &access_token).await {
            AccountLookup::Child(child) => {
                log.info(format!(
                    "Found active child account: {} ({}).",
                    child.descriptive_name.as_deref().unwrap_or("unnamed"),
                    child.id
                ));
                child.id
            }
            AccountLookup::NoChild => {
                log.warn("No child accounts found. Returning empty list.");
                return Ok(ProviderFetch::default());
            }
            AccountLookup::Failed => {
                log.warn("Child account lookup failed; continuing with the configured id.");
                creds.customer_id.clone()
            }
        };

        log.info(format!("Date filter applied: {} to {}", window.start, window.end));
        let url = self.search_url(&target_id);
        let body = json!({ "query": campaign_query(&window) });
        let login_customer_id = (target_id != creds.customer_id).then_some(creds.customer_id.as_str());

        let resp = http
            .execute(ctx.run_id, Platform::GoogleAds, |client| {
                let mut req = client
                    .post(&url)
                    .bearer_auth(&access_token)
                    .header("developer-token", &creds.developer_token)
                    .json(&body);
                if let Some(login) = login_customer_id {
                    req = req.header("login-customer-id", login);
                }
                req
            })
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, body, .. } => AdapterError::Api {
                    provider: "Google Ads",
                    status,
                    body: truncate_chars(&body, ERROR_BODY_LIMIT),
                },
                other => AdapterError::Fetch(other),
            })?;

        let campaigns = parse_google_search_response(&resp.json()?);
        log.info(format!("Found {} campaigns.", campaigns.len()));
        Ok(ProviderFetch {
            campaigns,
            raw_body: Some(resp.body),
        })
    }
}
