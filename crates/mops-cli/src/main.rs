use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mops_core::{aggregate, campaign_stats, reconcile_all, CampaignQuery, Platform, RecordFilter};
use mops_storage::{CampaignStore, PgCampaignStore};
use mops_sync::{SyncConfig, SyncOrchestrator, SyncReport, SyncRequest};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mops-cli")]
#[command(about = "Marketing ops metrics pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull campaigns from the ad platforms into the sink.
    Sync {
        /// Only sync one platform (google-ads or meta-ads).
        #[arg(long)]
        platform: Option<Platform>,
        #[arg(long)]
        start_date: Option<NaiveDate>,
        #[arg(long)]
        end_date: Option<NaiveDate>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the read API, change listener and scheduler.
    Serve,
    /// Print reconciled totals from the sink.
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

fn init_tracing() {
    let level = std::env::var("MOPS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let format = LogFormat::from_env_value(std::env::var("MOPS_LOG_FORMAT").ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };
    if let Err(err) = installed {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

async fn connect_store(config: &SyncConfig) -> Result<PgCampaignStore> {
    PgCampaignStore::connect(&config.database_url)
        .await
        .context("connecting to the campaign sink")
}

async fn run_sync(platform: Option<Platform>, request: SyncRequest) -> Result<usize> {
    let config = SyncConfig::from_env()?;
    let store: Arc<dyn CampaignStore> = Arc::new(connect_store(&config).await?);
    let orchestrator = SyncOrchestrator::from_config(&config, store)?;

    let reports: Vec<(Platform, SyncReport)> = match platform {
        Some(platform) => vec![(platform, orchestrator.sync_platform(platform, &request).await.into())],
        None => {
            let report = orchestrator.sync_all(&request).await;
            report.log_summary();
            vec![
                (Platform::GoogleAds, report.google_ads),
                (Platform::MetaAds, report.meta_ads),
            ]
        }
    };

    let mut processed = 0;
    for (platform, report) in &reports {
        match report {
            SyncReport::Completed(outcome) => {
                println!("{platform}: processed {}", outcome.processed);
                processed += outcome.processed;
            }
            SyncReport::Failed(failure) => {
                println!("{platform}: failed: {}", failure.error);
                for line in &failure.logs {
                    println!("  {line}");
                }
            }
        }
    }
    if reports.iter().all(|(_, report)| report.is_failed()) {
        anyhow::bail!("every requested provider sync failed");
    }
    Ok(processed)
}

async fn run_stats() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    let records = reconcile_all(store.list_campaigns(&CampaignQuery::default()).await?);
    let summary = serde_json::json!({
        "stats": campaign_stats(&records),
        "dashboard": aggregate(&records, &RecordFilter::default()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync {
            platform,
            start_date,
            end_date,
        } => {
            let processed = run_sync(platform, SyncRequest::new(start_date, end_date)).await?;
            info!(processed, "sync complete");
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            connect_store(&config).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => mops_web::serve_from_env().await?,
        Commands::Stats => run_stats().await?,
    }

    Ok(())
}
