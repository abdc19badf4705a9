//! Axum JSON read API over the campaign sink, plus sync triggers and dashboard aggregates.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Datelike, NaiveDate, Utc};
use mops_core::aggregate::days_in_month;
use mops_core::{
    aggregate, budget_pacing, campaign_stats, ranked_breakdown, reconcile, reconcile_all, sort_records,
    CampaignPatch, CampaignQuery, CampaignRecord, CampaignStatus, MetricKey, MonthlyBudget, NewCampaign,
    Platform, RecordFilter, SortOrder,
};
use mops_storage::{CampaignStore, PgCampaignStore, StoreError};
use mops_sync::{
    build_scheduler, spawn_change_listener, CampaignCache, ConfigError, LoadError, SyncConfig,
    SyncFailure, SyncOrchestrator, SyncOutcome, SyncRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mops-web";

const DEFAULT_BREAKDOWN_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("MOPS_WEB_PORT") {
            Ok(value) if !value.trim().is_empty() => {
                value.trim().parse().map_err(|_| ConfigError::Invalid {
                    var: "MOPS_WEB_PORT",
                    value,
                    reason: "expected a port number",
                })?
            }
            _ => 8000,
        };
        Ok(Self { port })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CampaignStore>,
    pub cache: Arc<CampaignCache>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(store: Arc<dyn CampaignStore>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            cache: Arc::new(CampaignCache::new(store.clone())),
            store,
            orchestrator,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CampaignCache>) -> Self {
        self.cache = cache;
        self
    }
}

/// Every response body: exactly one of `data` and `error` is non-null.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
}

fn respond<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(Envelope {
            data: Some(data),
            error: None,
            logs: None,
        }),
    )
        .into_response()
}

fn ok<T: Serialize>(data: T) -> Response {
    respond(StatusCode::OK, data)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(self) -> String {
        match self {
            ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Unavailable(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(Envelope::<()> {
                data: None,
                error: Some(self.message()),
                logs: None,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_connectivity() {
            return ApiError::Unavailable(err.to_string());
        }
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            StoreError::Invalid(_) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

type ApiResult = Result<Response, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/campaigns", get(list_campaigns_handler).post(create_campaign_handler))
        .route("/api/campaigns/stats", get(stats_handler))
        .route(
            "/api/campaigns/{id}",
            get(get_campaign_handler)
                .patch(update_campaign_handler)
                .delete(delete_campaign_handler),
        )
        .route("/api/sync", post(sync_all_handler))
        .route("/api/sync/google-ads", post(sync_google_ads_handler))
        .route("/api/sync/meta-ads", post(sync_meta_ads_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/dashboard/pacing", get(pacing_handler))
        .route("/api/dashboard/breakdown/{metric}", get(breakdown_handler))
        .route("/api/dashboard/table", get(table_handler))
        .route("/api/budgets/{month}", get(get_budget_handler).put(put_budget_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "read api listening");
    axum::serve(listener, app(state)).await.context("serving read api")?;
    Ok(())
}

/// Wire the Postgres sink, cache, change listener and optional scheduler, then serve.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let sync_config = SyncConfig::from_env()?;
    let web_config = WebConfig::from_env()?;

    let pg = PgCampaignStore::connect_lazy(&sync_config.database_url).context("configuring database pool")?;
    let pool = pg.pool().clone();
    let store: Arc<dyn CampaignStore> = Arc::new(pg);

    let cache = Arc::new(CampaignCache::new(store.clone()));
    if let Err(err) = cache.reload().await {
        warn!(error = %err, "initial campaign load failed");
    }
    spawn_change_listener(pool, cache.clone());

    let orchestrator = Arc::new(SyncOrchestrator::from_config(&sync_config, store.clone())?);
    let scheduler = build_scheduler(&sync_config, orchestrator.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!("sync scheduler started");
    }

    let state = AppState::new(store, orchestrator).with_cache(cache);
    serve(state, web_config.port).await
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid campaign id {raw}")))
}

fn parse_optional<T: std::str::FromStr>(raw: Option<&str>) -> Result<Option<T>, ApiError>
where
    T::Err: std::fmt::Display,
{
    match raw.map(str::trim).filter(|v| !v.is_empty() && *v != "all") {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|err: T::Err| ApiError::BadRequest(err.to_string())),
    }
}

/// Cached, reconciled records. The sink is pinged first so an outage is a 503
/// rather than a silently stale snapshot. A cache that never loaded, or whose
/// last read failed, is reloaded on demand.
async fn cached_records(state: &AppState) -> Result<Arc<Vec<CampaignRecord>>, ApiError> {
    if let Err(err) = state.store.ping().await {
        warn!(error = %err, "sink unreachable, not serving cached campaigns");
        state.cache.mark_unavailable(err.to_string()).await;
        return Err(ApiError::Unavailable(err.to_string()));
    }
    if state.cache.needs_reload().await {
        match state.cache.reload().await {
            Ok(_) | Err(LoadError::Empty) => {}
            Err(LoadError::Unavailable(message)) => return Err(ApiError::Unavailable(message)),
        }
    }
    Ok(state.cache.snapshot().await)
}

async fn refresh_cache(state: &AppState) {
    if let Err(err) = state.cache.reload().await {
        warn!(error = %err, "cache refresh after write failed");
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => ok(json!({
            "status": "ok",
            "sink": "up",
            "cache": state.cache.health().await,
            "cache_error": state.cache.last_failure().await,
        })),
        Err(err) => ApiError::Unavailable(err.to_string()).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    status: Option<String>,
    platform: Option<String>,
}

async fn list_campaigns_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let query = CampaignQuery {
        status: parse_optional::<CampaignStatus>(params.status.as_deref())?,
        platform: parse_optional::<Platform>(params.platform.as_deref())?,
    };
    let rows = state.store.list_campaigns(&query).await?;
    Ok(ok(reconcile_all(rows)))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let rows = reconcile_all(state.store.list_campaigns(&CampaignQuery::default()).await?);
    Ok(ok(campaign_stats(&rows)))
}

async fn get_campaign_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id)?;
    match state.store.get_campaign(id).await? {
        Some(record) => Ok(ok(reconcile(record))),
        None => Err(StoreError::NotFound(id).into()),
    }
}

async fn create_campaign_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewCampaign>, JsonRejection>,
) -> ApiResult {
    let Json(campaign) = body?;
    if campaign.name.trim().is_empty() {
        return Err(ApiError::BadRequest("campaign name is required".into()));
    }
    let created = state.store.create_campaign(campaign).await?;
    info!(id = ?created.id, platform = %created.platform, "campaign created");
    refresh_cache(&state).await;
    Ok(respond(StatusCode::CREATED, created))
}

async fn update_campaign_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<CampaignPatch>, JsonRejection>,
) -> ApiResult {
    let id = parse_id(&id)?;
    let Json(patch) = body?;
    let updated = state.store.update_campaign(id, &patch).await?;
    refresh_cache(&state).await;
    Ok(ok(reconcile(updated)))
}

async fn delete_campaign_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id)?;
    state.store.delete_campaign(id).await?;
    info!(%id, "campaign deleted");
    refresh_cache(&state).await;
    Ok(ok(json!({ "id": id })))
}

fn parse_sync_request(body: &Bytes) -> Result<SyncRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SyncRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(format!("invalid sync request: {err}")))
}

fn sync_response(result: Result<SyncOutcome, SyncFailure>) -> Response {
    match result {
        Ok(outcome) => ok(outcome),
        Err(failure) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Envelope::<()> {
                data: None,
                error: Some(failure.error),
                logs: Some(failure.logs),
            }),
        )
            .into_response(),
    }
}

async fn reload_after_sync(state: &AppState) -> serde_json::Value {
    match state.cache.reload_after_sync().await {
        Ok(health) => json!({ "status": "loaded", "health": health }),
        Err(LoadError::Empty) => json!({ "status": "empty" }),
        Err(LoadError::Unavailable(message)) => json!({ "status": "unavailable", "error": message }),
    }
}

async fn sync_google_ads_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request = parse_sync_request(&body)?;
    let result = state.orchestrator.sync_google_ads(&request).await;
    if result.is_ok() {
        reload_after_sync(&state).await;
    }
    Ok(sync_response(result))
}

async fn sync_meta_ads_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request = parse_sync_request(&body)?;
    let result = state.orchestrator.sync_meta_ads(&request).await;
    if result.is_ok() {
        reload_after_sync(&state).await;
    }
    Ok(sync_response(result))
}

async fn sync_all_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let request = parse_sync_request(&body)?;
    let report = state.orchestrator.sync_all(&request).await;
    report.log_summary();
    let cache = reload_after_sync(&state).await;
    Ok(ok(json!({
        "processed": report.processed(),
        "google_ads": report.google_ads,
        "meta_ads": report.meta_ads,
        "cache": cache,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct DashboardParams {
    status: Option<String>,
    platform: Option<String>,
    #[serde(alias = "search")]
    q: Option<String>,
    #[serde(default)]
    active_only: bool,
    sort: Option<String>,
    order: Option<String>,
    limit: Option<usize>,
    month: Option<String>,
}

impl DashboardParams {
    fn filter(&self) -> Result<RecordFilter, ApiError> {
        Ok(RecordFilter {
            status: parse_optional::<CampaignStatus>(self.status.as_deref())?,
            platform: parse_optional::<Platform>(self.platform.as_deref())?,
            search: self.q.clone().filter(|q| !q.trim().is_empty()),
            active_only: self.active_only,
        })
    }
}

async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<DashboardParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let filter = params.filter()?;
    let records = cached_records(&state).await?;
    Ok(ok(aggregate(&records, &filter)))
}

fn month_start(month: &str) -> Result<NaiveDate, ApiError> {
    let invalid = || ApiError::BadRequest(format!("invalid month {month}, expected YYYY-MM"));
    if !MonthlyBudget::is_valid_month(month) {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").map_err(|_| invalid())
}

/// The day pacing is measured at: today inside the current month, the last
/// day for past months and the first day for future ones.
fn pacing_reference_date(month_start: NaiveDate, today: NaiveDate) -> NaiveDate {
    if (today.year(), today.month()) == (month_start.year(), month_start.month()) {
        today
    } else if today > month_start {
        month_start
            .with_day(days_in_month(month_start))
            .unwrap_or(month_start)
    } else {
        month_start
    }
}

async fn pacing_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<DashboardParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let today = Utc::now().date_naive();
    let month = params
        .month
        .clone()
        .unwrap_or_else(|| today.format("%Y-%m").to_string());
    let start = month_start(&month)?;

    let manual_budget = state
        .store
        .monthly_budget(&month)
        .await?
        .map(|b| b.total())
        .unwrap_or(0.0);
    let records = cached_records(&state).await?;
    let pacing = budget_pacing(&records, manual_budget, pacing_reference_date(start, today));
    Ok(ok(json!({
        "month": month,
        "manual_budget": manual_budget,
        "pacing": pacing,
    })))
}

async fn breakdown_handler(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
    params: Result<Query<DashboardParams>, QueryRejection>,
) -> ApiResult {
    let key: MetricKey = metric.parse().map_err(|err| ApiError::BadRequest(format!("{err}")))?;
    let Query(params) = params?;
    let filter = params.filter()?;
    let records = cached_records(&state).await?;
    let mut ranked = ranked_breakdown(filter.apply(&records), key);
    ranked.truncate(params.limit.unwrap_or(DEFAULT_BREAKDOWN_LIMIT));
    Ok(ok(json!({ "metric": key, "entries": ranked })))
}

async fn table_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<DashboardParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let filter = params.filter()?;
    let records = cached_records(&state).await?;
    let mut rows: Vec<CampaignRecord> = filter.apply(&records).into_iter().cloned().collect();
    if let Some(key) = parse_optional::<MetricKey>(params.sort.as_deref())? {
        let order = parse_optional::<SortOrder>(params.order.as_deref())?.unwrap_or_default();
        sort_records(&mut rows, key, order);
    }
    Ok(ok(rows))
}

#[derive(Debug, Deserialize)]
struct BudgetInput {
    #[serde(default)]
    google_budget: f64,
    #[serde(default)]
    meta_budget: f64,
}

async fn get_budget_handler(State(state): State<Arc<AppState>>, Path(month): Path<String>) -> ApiResult {
    month_start(&month)?;
    let budget = state
        .store
        .monthly_budget(&month)
        .await?
        .unwrap_or(MonthlyBudget {
            month,
            google_budget: 0.0,
            meta_budget: 0.0,
            updated_at: None,
        });
    Ok(ok(json!({ "total": budget.total(), "budget": budget })))
}

async fn put_budget_handler(
    State(state): State<Arc<AppState>>,
    Path(month): Path<String>,
    body: Result<Json<BudgetInput>, JsonRejection>,
) -> ApiResult {
    month_start(&month)?;
    let Json(input) = body?;
    let saved = state
        .store
        .upsert_monthly_budget(&MonthlyBudget {
            month,
            google_budget: input.google_budget,
            meta_budget: input.meta_budget,
            updated_at: None,
        })
        .await?;
    Ok(ok(json!({ "total": saved.total(), "budget": saved })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mops_storage::MemoryCampaignStore;
    use mops_sync::ReloadPolicy;
    use serde_json::Value;
    use tower::ServiceExt;

    fn record(platform: Platform, external_id: &str, status: CampaignStatus, spend: f64, impressions: u64, clicks: u64) -> CampaignRecord {
        let mut r = CampaignRecord::new(platform, external_id, format!("Campaign {external_id}"), status, Utc::now());
        r.spend = spend;
        r.impressions = impressions;
        r.clicks = clicks;
        r
    }

    async fn state_with(records: Vec<CampaignRecord>) -> (AppState, Arc<MemoryCampaignStore>) {
        let store = Arc::new(MemoryCampaignStore::new());
        if !records.is_empty() {
            store.upsert_campaigns(&records).await.unwrap();
        }
        let orchestrator = Arc::new(SyncOrchestrator::from_config(&SyncConfig::default(), store.clone()).unwrap());
        let cache = CampaignCache::new(store.clone()).with_policy(ReloadPolicy {
            attempts: 1,
            delay: std::time::Duration::ZERO,
        });
        (
            AppState::new(store.clone(), orchestrator).with_cache(Arc::new(cache)),
            store,
        )
    }

    fn sample() -> Vec<CampaignRecord> {
        let mut meta = record(Platform::MetaAds, "m1", CampaignStatus::Active, 0.0, 1000, 10);
        meta.raw_data = json!({"insights": {"spend": "0", "clicks": "10", "impressions": "1000", "cpc": "2.5"}});
        vec![
            record(Platform::GoogleAds, "g1", CampaignStatus::Active, 100.0, 2000, 40),
            record(Platform::GoogleAds, "g2", CampaignStatus::Paused, 50.0, 500, 25),
            meta,
        ]
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn list_returns_reconciled_rows_and_filters() {
        let (state, _) = state_with(sample()).await;
        let app = app(state);

        let (status, body) = send(&app, "GET", "/api/campaigns", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["error"].is_null());
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        let meta = rows.iter().find(|r| r["external_id"] == "m1").unwrap();
        assert_eq!(meta["spend"], 25.0);
        assert_eq!(meta["ctr"], 1.0);

        let (_, body) = send(&app, "GET", "/api/campaigns?platform=google-ads&status=active", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", "/api/campaigns?status=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["data"].is_null());
        assert!(body["error"].as_str().unwrap().contains("sleeping"));
    }

    #[tokio::test]
    async fn stats_are_pre_aggregated() {
        let (state, _) = state_with(sample()).await;
        let (status, body) = send(&app(state), "GET", "/api/campaigns/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_active"], 2);
        assert_eq!(body["data"]["total_spend"], 175.0);
        assert_eq!(body["data"]["total_impressions"], 3500);
        assert_eq!(body["data"]["total_clicks"], 75);
    }

    #[tokio::test]
    async fn crud_flow_uses_envelopes_and_status_codes() {
        let (state, _) = state_with(vec![]).await;
        let app = app(state);

        let (status, body) = send(
            &app,
            "POST",
            "/api/campaigns",
            Some(json!({"platform": "Meta Ads", "name": "Manual push", "budget": 500.0})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["status"], "draft");
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            "PATCH",
            &format!("/api/campaigns/{id}"),
            Some(json!({"status": "active", "clicks": 5, "impressions": 250})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ctr"], 2.0);

        let (status, _) = send(&app, "GET", &format!("/api/campaigns/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "DELETE", &format!("/api/campaigns/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", &format!("/api/campaigns/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));

        let (status, _) = send(&app, "GET", "/api/campaigns/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unreachable_sink_is_503_not_empty_data() {
        let (state, store) = state_with(sample()).await;
        store.set_unavailable(true);
        let app = app(state);

        for uri in ["/api/campaigns", "/api/dashboard", "/healthz"] {
            let (status, body) = send(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
            assert!(body["data"].is_null());
            assert!(body["error"].is_string());
        }
    }

    #[tokio::test]
    async fn sink_outage_after_first_load_is_503_until_it_recovers() {
        let (state, store) = state_with(sample()).await;
        let app = app(state);

        let (status, body) = send(&app, "GET", "/api/dashboard", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["record_count"], 3);

        store.set_unavailable(true);
        for uri in ["/api/dashboard", "/api/campaigns/stats", "/api/dashboard/breakdown/spend"] {
            let (status, body) = send(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
            assert!(body["data"].is_null());
        }

        store.set_unavailable(false);
        let (status, body) = send(&app, "GET", "/api/dashboard", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["record_count"], 3);
    }

    #[tokio::test]
    async fn patched_metrics_on_synced_rows_are_not_undone_by_reconcile() {
        let mut synced = record(Platform::MetaAds, "m9", CampaignStatus::Active, 0.0, 0, 0);
        synced.raw_data = json!({"meta_status": "ACTIVE", "insights": {"spend": "10", "clicks": "4", "impressions": "200"}});
        let (state, store) = state_with(vec![synced]).await;
        let id = store.list_campaigns(&CampaignQuery::default()).await.unwrap()[0].id.unwrap();
        let app = app(state);

        let (status, body) = send(
            &app,
            "PATCH",
            &format!("/api/campaigns/{id}"),
            Some(json!({"spend": 50.0, "clicks": 20})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["spend"], 50.0);
        assert_eq!(body["data"]["clicks"], 20);
        assert_eq!(body["data"]["ctr"], 10.0);

        let (_, body) = send(&app, "GET", &format!("/api/campaigns/{id}"), None).await;
        assert_eq!(body["data"]["spend"], 50.0);
        assert_eq!(body["data"]["clicks"], 20);
        assert_eq!(body["data"]["impressions"], 200);

        let (_, body) = send(&app, "GET", "/api/campaigns/stats", None).await;
        assert_eq!(body["data"]["total_spend"], 50.0);
        assert_eq!(body["data"]["total_clicks"], 20);
    }

    #[tokio::test]
    async fn dashboard_totals_and_platform_split() {
        let (state, _) = state_with(sample()).await;
        let app = app(state);

        let (status, body) = send(&app, "GET", "/api/dashboard", None).await;
        assert_eq!(status, StatusCode::OK);
        let data = &body["data"];
        assert_eq!(data["record_count"], 3);
        assert_eq!(data["totals"]["spend"], 175.0);
        assert_eq!(data["platform_split"]["google_ads"]["spend"], 150.0);
        assert_eq!(data["platform_split"]["meta_ads"]["spend"], 25.0);

        let (_, body) = send(&app, "GET", "/api/dashboard?active_only=true&q=G1", None).await;
        assert_eq!(body["data"]["record_count"], 1);
    }

    #[tokio::test]
    async fn pacing_uses_the_months_manual_budget() {
        let (state, _) = state_with(sample()).await;
        let app = app(state);

        let (status, _) = send(
            &app,
            "PUT",
            "/api/budgets/2026-01",
            Some(json!({"google_budget": 200.0, "meta_budget": 150.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "GET", "/api/dashboard/pacing?month=2026-01", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["manual_budget"], 350.0);
        // A past month is measured at its last day.
        assert_eq!(body["data"]["pacing"]["day_percent"], 100.0);
        assert_eq!(body["data"]["pacing"]["spend_percent"], 50.0);

        let (status, _) = send(&app, "GET", "/api/dashboard/pacing?month=2026-13", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn breakdown_and_table() {
        let mut records = sample();
        records.push(record(Platform::MetaAds, "tiny", CampaignStatus::Active, 1.0, 10, 9));
        let (state, _) = state_with(records).await;
        let app = app(state);

        let (status, body) = send(&app, "GET", "/api/dashboard/breakdown/ctr", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body["data"]["entries"].as_array().unwrap();
        // Under 1000 impressions: g2 and tiny are left out.
        let ids: Vec<&str> = entries.iter().map(|e| e["external_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["g1", "m1"]);
        assert_eq!(entries[0]["value"], 2.0);

        let (status, _) = send(&app, "GET", "/api/dashboard/breakdown/reach", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = send(&app, "GET", "/api/dashboard/table?sort=spend&order=asc", None).await;
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["external_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["tiny", "m1", "g2", "g1"]);
    }

    #[tokio::test]
    async fn provider_sync_without_credentials_reports_error_and_logs() {
        let (state, _) = state_with(vec![]).await;
        let app = app(state);

        let (status, body) = send(&app, "POST", "/api/sync/meta-ads", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["error"],
            "Missing META_ACCESS_TOKEN or META_ACCOUNT_ID environment variables"
        );
        assert!(body["logs"].as_array().unwrap().iter().any(|l| l.as_str().unwrap().starts_with("ERROR: ")));

        let (status, body) = send(&app, "POST", "/api/sync", Some(json!({"startDate": "2026-01-01"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["google_ads"]["error"], "Missing Google Ads environment variables");
        assert_eq!(body["data"]["processed"], 0);

        let (status, _) = send(&app, "POST", "/api/sync/google-ads", Some(json!({"startDate": "soon"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn budgets_default_to_zero_and_validate_month() {
        let (state, _) = state_with(vec![]).await;
        let app = app(state);

        let (status, body) = send(&app, "GET", "/api/budgets/2026-10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 0.0);

        let (status, _) = send(&app, "GET", "/api/budgets/october", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn pacing_reference_date_by_month_position() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let current = NaiveDate::from_ymd_opt(2026, 10, 1).unwrap();
        let past = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let future = NaiveDate::from_ymd_opt(2026, 12, 1).unwrap();
        assert_eq!(pacing_reference_date(current, today), today);
        assert_eq!(pacing_reference_date(past, today), NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
        assert_eq!(pacing_reference_date(future, today), future);
    }
}
