//! Ads provider contracts and the Google Ads / Meta Ads implementations.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mops_core::{Platform, RawCampaign};
use mops_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod google;
pub mod meta;

pub use google::{GoogleAdsAdapter, GoogleAdsCredentials};
pub use meta::{MetaAdsAdapter, MetaAdsCredentials};

pub const CRATE_NAME: &str = "mops-adapters";

/// Campaign rows requested per provider call.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Inclusive reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, AdapterError> {
        if start > end {
            return Err(AdapterError::InvalidWindow(format!("{start} is after {end}")));
        }
        Ok(Self { start, end })
    }

    /// Google Ads lookback used when the caller gives no dates.
    pub fn google_default(today: NaiveDate) -> Self {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(today);
        Self {
            start: start.min(today),
            end: today,
        }
    }

    /// Fill whichever side is missing from the Google Ads default.
    pub fn from_parts(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<Self, AdapterError> {
        let default = Self::google_default(today);
        Self::new(start.unwrap_or(default.start), end.unwrap_or(default.end))
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    MissingCredentials(&'static str),
    #[error("Failed to refresh token: {0}")]
    TokenRefresh(String),
    #[error("{provider} API Error {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("invalid date window: {0}")]
    InvalidWindow(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Human-readable log of one provider sync, returned to the caller.
/// Every line is also emitted as a tracing event.
#[derive(Debug, Clone)]
pub struct SyncLog {
    platform: Platform,
    lines: Vec<String>,
}

impl SyncLog {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            lines: Vec::new(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(platform = %self.platform, "{message}");
        self.lines.push(message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(platform = %self.platform, "{message}");
        self.lines.push(message);
    }

    pub fn error(&mut self, message: impl fmt::Display) {
        error!(platform = %self.platform, "{message}");
        self.lines.push(format!("ERROR: {message}"));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// What one provider call produced.
#[derive(Debug, Clone, Default)]
pub struct ProviderFetch {
    pub campaigns: Vec<RawCampaign>,
    /// Campaign response body, for the raw response archive.
    pub raw_body: Option<Vec<u8>>,
}

#[async_trait]
pub trait AdsProvider: Send + Sync {
    fn platform(&self) -> Platform;

    /// Fetch up to [`PAGE_SIZE`] campaign-level records.
    async fn fetch_campaigns(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        window: Option<DateWindow>,
        log: &mut SyncLog,
    ) -> Result<ProviderFetch, AdapterError>;
}

/// Credentials and endpoints for both providers.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub google: Option<GoogleAdsCredentials>,
    pub meta: Option<MetaAdsCredentials>,
    pub google_ads_api_base: String,
    pub google_oauth_token_url: String,
    pub meta_graph_api_base: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            google: None,
            meta: None,
            google_ads_api_base: google::DEFAULT_API_BASE.to_string(),
            google_oauth_token_url: google::DEFAULT_TOKEN_URL.to_string(),
            meta_graph_api_base: meta::DEFAULT_GRAPH_BASE.to_string(),
        }
    }
}

pub fn provider_for_platform(platform: Platform, settings: &ProviderSettings) -> Box<dyn AdsProvider> {
    match platform {
        Platform::GoogleAds => Box::new(GoogleAdsAdapter::new(
            settings.google.clone(),
            &settings.google_ads_api_base,
            &settings.google_oauth_token_url,
        )),
        Platform::MetaAds => Box::new(MetaAdsAdapter::new(
            settings.meta.clone(),
            &settings.meta_graph_api_base,
        )),
    }
}

/// Non-empty, trimmed value or `None`.
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use mops_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};

    pub fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .unwrap()
    }
}
