use std::collections::HashMap;
use std::time::Duration;

use mops_core::Platform;
use reqwest::{header::RETRY_AFTER, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

/// Exponential backoff between attempts, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16) as u32);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout; `None` leaves requests unbounded.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    /// Concurrent requests allowed against one ad platform.
    pub per_platform_limit: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: None,
            per_platform_limit: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A successful provider response, body fully read.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

impl ProviderResponse {
    pub fn json(&self) -> Result<serde_json::Value, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.url.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid JSON from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("http client is shutting down")]
    Closed,
}

fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Whole seconds from a `Retry-After` header; HTTP-date values are ignored.
fn retry_after(resp: &Response) -> Option<Duration> {
    let secs = resp.headers().get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

/// Outbound client shared by both provider adapters. Each platform gets its
/// own request lane so a slow provider never starves the other one.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    lanes: HashMap<Platform, Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        let lanes = Platform::ALL
            .into_iter()
            .map(|p| (p, Semaphore::new(config.per_platform_limit.max(1))))
            .collect();
        Ok(Self {
            client: builder.build()?,
            lanes,
            backoff: config.backoff,
        })
    }

    /// Send the request built by `build`, rebuilding it for each retry.
    /// Non-2xx answers come back as `FetchError::HttpStatus` carrying the body
    /// so adapters can surface the provider's own message.
    pub async fn execute<F>(&self, run_id: Uuid, platform: Platform, build: F) -> Result<ProviderResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let _permit = match self.lanes.get(&platform) {
            Some(lane) => Some(lane.acquire().await.map_err(|_| FetchError::Closed)?),
            None => None,
        };
        let span = info_span!("provider_request", %run_id, platform = platform.slug());
        self.send(&build).instrument(span).await
    }

    async fn send<F>(&self, build: &F) -> Result<ProviderResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let mut retry = 0;
        loop {
            let retries_left = retry < self.backoff.max_retries;
            let pause = match build(&self.client).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(ProviderResponse { status, url, body });
                }
                Ok(resp) if retries_left && retryable_status(resp.status()) => {
                    warn!(status = resp.status().as_u16(), retry, "provider answered with a retryable status");
                    retry_after(&resp)
                        .map(|wait| wait.min(self.backoff.max_delay))
                        .unwrap_or_else(|| self.backoff.delay(retry))
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let url = resp.url().to_string();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus { status, url, body });
                }
                Err(err) if retries_left && retryable_error(&err) => {
                    warn!(error = %err.without_url(), retry, "provider request failed, retrying");
                    self.backoff.delay(retry)
                }
                Err(err) => return Err(FetchError::Request(err)),
            };
            tokio::time::sleep(pause).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn throttled_and_failing_answers_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/campaigns"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/campaigns"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/campaigns"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":[1]}"#))
            .mount(&server)
            .await;

        let url = format!("{}/campaigns", server.uri());
        let resp = fetcher(2)
            .execute(Uuid::new_v4(), Platform::MetaAds, |client| client.get(&url))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.json().unwrap()["data"][0], 1);
    }

    #[tokio::test]
    async fn client_errors_return_the_body_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad query"))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/search", server.uri());
        let err = fetcher(3)
            .execute(Uuid::new_v4(), Platform::GoogleAds, |client| client.post(&url).body("{}"))
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad query");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn configured_timeout_fails_slow_providers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let timeout_fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Some(Duration::from_millis(50)),
            backoff: BackoffPolicy::none(),
            ..Default::default()
        })
        .unwrap();
        let url = format!("{}/slow", server.uri());
        let err = timeout_fetcher
            .execute(Uuid::new_v4(), Platform::MetaAds, |client| client.get(&url))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(ref e) if e.is_timeout()));

        assert_eq!(HttpClientConfig::default().timeout, None);
        let resp = fetcher(0)
            .execute(Uuid::new_v4(), Platform::MetaAds, |client| client.get(&url))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn undecodable_bodies_name_the_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let url = format!("{}/broken", server.uri());
        let resp = fetcher(0)
            .execute(Uuid::new_v4(), Platform::GoogleAds, |client| client.get(&url))
            .await
            .unwrap();
        match resp.json() {
            Err(FetchError::Decode { url: failed, .. }) => assert!(failed.ends_with("/broken")),
            other => panic!("expected decode error, got {other:?}"),
        }
    }
}
