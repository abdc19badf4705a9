//! Sync orchestration: provider fetch, reconciliation, sink upsert, cache reload and scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use mops_adapters::{
    provider_for_platform, AdapterContext, AdapterError, AdsProvider, DateWindow, SyncLog,
};
use mops_core::{canonicalize, CampaignRecord, Platform};
use mops_storage::{CampaignStore, HttpFetcher, ResponseArchive, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

pub mod cache;
pub mod config;
pub mod realtime;

pub use cache::{CampaignCache, DataHealth, LoadError, ReloadPolicy};
pub use config::{ConfigError, SyncConfig};
pub use realtime::{listen_for_changes, spawn_change_listener, CHANGE_CHANNEL};

pub const CRATE_NAME: &str = "mops-sync";

/// Caller-supplied reporting window for a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default, alias = "start_date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, alias = "end_date")]
    pub end_date: Option<NaiveDate>,
}

impl SyncRequest {
    pub fn new(start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> Self {
        Self { start_date, end_date }
    }

    /// Google Ads always queries a window, defaulting either side. Meta Ads
    /// only narrows when both dates are given and otherwise asks for the
    /// lifetime preset.
    pub fn window_for(&self, platform: Platform, today: NaiveDate) -> Result<Option<DateWindow>, AdapterError> {
        match platform {
            Platform::GoogleAds => DateWindow::from_parts(self.start_date, self.end_date, today).map(Some),
            Platform::MetaAds => match (self.start_date, self.end_date) {
                (Some(start), Some(end)) => DateWindow::new(start, end).map(Some),
                _ => Ok(None),
            },
        }
    }
}

#[derive(Debug, Error)]
enum SyncError {
    #[error(transparent)]
    Provider(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub processed: usize,
    pub data: Vec<CampaignRecord>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub error: String,
    pub logs: Vec<String>,
}

/// Result of one provider sync in its wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SyncReport {
    Completed(SyncOutcome),
    Failed(SyncFailure),
}

impl SyncReport {
    pub fn is_failed(&self) -> bool {
        matches!(self, SyncReport::Failed(_))
    }

    pub fn processed(&self) -> usize {
        match self {
            SyncReport::Completed(outcome) => outcome.processed,
            SyncReport::Failed(_) => 0,
        }
    }
}

impl From<Result<SyncOutcome, SyncFailure>> for SyncReport {
    fn from(result: Result<SyncOutcome, SyncFailure>) -> Self {
        match result {
            Ok(outcome) => SyncReport::Completed(outcome),
            Err(failure) => SyncReport::Failed(failure),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncAllReport {
    pub google_ads: SyncReport,
    pub meta_ads: SyncReport,
}

impl SyncAllReport {
    pub fn processed(&self) -> usize {
        self.google_ads.processed() + self.meta_ads.processed()
    }

    pub fn log_summary(&self) {
        for (platform, report) in [(Platform::GoogleAds, &self.google_ads), (Platform::MetaAds, &self.meta_ads)] {
            match report {
                SyncReport::Completed(outcome) => {
                    info!(%platform, processed = outcome.processed, "provider sync completed")
                }
                SyncReport::Failed(failure) => {
                    warn!(%platform, error = %failure.error, "provider sync failed")
                }
            }
        }
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn CampaignStore>,
    http: HttpFetcher,
    archive: Option<ResponseArchive>,
    google: Box<dyn AdsProvider>,
    meta: Box<dyn AdsProvider>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        http: HttpFetcher,
        google: Box<dyn AdsProvider>,
        meta: Box<dyn AdsProvider>,
    ) -> Self {
        Self {
            store,
            http,
            archive: None,
            google,
            meta,
        }
    }

    pub fn from_config(config: &SyncConfig, store: Arc<dyn CampaignStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building provider http client")?;
        let orchestrator = Self::new(
            store,
            http,
            provider_for_platform(Platform::GoogleAds, &config.providers),
            provider_for_platform(Platform::MetaAds, &config.providers),
        );
        Ok(orchestrator.with_archive(config.archive_dir.clone().map(ResponseArchive::new)))
    }

    pub fn with_archive(mut self, archive: Option<ResponseArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn store(&self) -> &Arc<dyn CampaignStore> {
        &self.store
    }

    pub async fn sync_google_ads(&self, request: &SyncRequest) -> Result<SyncOutcome, SyncFailure> {
        self.run_provider(self.google.as_ref(), request).await
    }

    pub async fn sync_meta_ads(&self, request: &SyncRequest) -> Result<SyncOutcome, SyncFailure> {
        self.run_provider(self.meta.as_ref(), request).await
    }

    pub async fn sync_platform(&self, platform: Platform, request: &SyncRequest) -> Result<SyncOutcome, SyncFailure> {
        match platform {
            Platform::GoogleAds => self.sync_google_ads(request).await,
            Platform::MetaAds => self.sync_meta_ads(request).await,
        }
    }

    /// Both providers concurrently; a failure on one side never cancels the other.
    pub async fn sync_all(&self, request: &SyncRequest) -> SyncAllReport {
        let (google, meta) = tokio::join!(self.sync_google_ads(request), self.sync_meta_ads(request));
        SyncAllReport {
            google_ads: google.into(),
            meta_ads: meta.into(),
        }
    }

    async fn run_provider(&self, provider: &dyn AdsProvider, request: &SyncRequest) -> Result<SyncOutcome, SyncFailure> {
        let platform = provider.platform();
        let ctx = AdapterContext::new();
        let span = info_span!("provider_sync", run_id = %ctx.run_id, platform = platform.slug());

        async move {
            let mut log = SyncLog::new(platform);
            log.info(format!("Sync started: {platform}"));
            match self.fetch_and_store(provider, &ctx, request, &mut log).await {
                Ok(data) => Ok(SyncOutcome {
                    processed: data.len(),
                    data,
                    logs: log.into_lines(),
                }),
                Err(err) => {
                    log.error(format!("Sync failed: {err}"));
                    Err(SyncFailure {
                        error: err.to_string(),
                        logs: log.into_lines(),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_and_store(
        &self,
        provider: &dyn AdsProvider,
        ctx: &AdapterContext,
        request: &SyncRequest,
        log: &mut SyncLog,
    ) -> Result<Vec<CampaignRecord>, SyncError> {
        let platform = provider.platform();
        let window = request.window_for(platform, ctx.fetched_at.date_naive())?;
        let fetched = provider.fetch_campaigns(&self.http, ctx, window, log).await?;

        if let (Some(archive), Some(body)) = (&self.archive, &fetched.raw_body) {
            match archive.store_response(ctx.fetched_at, platform, body).await {
                Ok(archived) => log.info(format!(
                    "Archived raw response {}",
                    archived.path.display()
                )),
                Err(err) => log.warn(format!("Raw response archive failed: {err:#}")),
            }
        }

        let records: Vec<CampaignRecord> = fetched
            .campaigns
            .iter()
            .map(|raw| canonicalize(raw, ctx.fetched_at))
            .collect();
        if records.is_empty() {
            log.info("No campaigns to upsert.");
            return Ok(records);
        }

        log.info(format!("Upserting {} campaigns...", records.len()));
        let written = self.store.upsert_campaigns(&records).await?;
        log.info(format!("Upserted {} campaigns.", written.len()));
        Ok(written)
    }
}

/// Cron jobs running `sync_all`, or `None` when scheduling is disabled.
pub async fn build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let orchestrator = orchestrator.clone();
        let schedule = cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            let schedule = schedule.clone();
            Box::pin(async move {
                info!(%schedule, "scheduled sync triggered");
                let report = orchestrator.sync_all(&SyncRequest::default()).await;
                report.log_summary();
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
