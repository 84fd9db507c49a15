//! Ingestion orchestration: explicit config, per-network jobs, run reports and
//! independent cron schedules.

mod config;
mod job;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use adsync_adapters::{adapter_for_source, AdapterContext, MatomoAdapter, NetworkAdapter};
use adsync_core::{DateWindow, SourceSystem};
use adsync_storage::{HttpClientConfig, ReportArchive, ReportFetcher};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use config::{NetworkConfig, NetworkMode, NetworkRegistry, SyncConfig, DEFAULT_DATABASE_URL};
pub use job::{IngestOutcome, IngestReport, IngestStore, IngestionJob};

pub const CRATE_NAME: &str = "adsync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct NetworkRunSummary {
    pub network: SourceSystem,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<IngestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: DateWindow,
    pub networks: Vec<NetworkRunSummary>,
    pub summary_path: String,
}

impl IngestRunSummary {
    pub fn failed_networks(&self) -> impl Iterator<Item = &NetworkRunSummary> {
        self.networks.iter().filter(|n| n.status != "completed")
    }
}

fn adapter_for(network: &NetworkConfig, source: SourceSystem) -> Box<dyn NetworkAdapter> {
    match (source, network.site_id) {
        (SourceSystem::Matomo, Some(site_id)) => Box::new(MatomoAdapter { site_id }),
        _ => adapter_for_source(source),
    }
}

pub struct SyncService {
    config: SyncConfig,
    jobs: Vec<Arc<IngestionJob>>,
}

impl SyncService {
    /// Builds one job per enabled network in `networks.yaml`.
    pub async fn from_config(config: SyncConfig, store: Arc<dyn IngestStore>) -> Result<Self> {
        let registry = NetworkRegistry::load(&config.registry_path()).await?;
        let http = Arc::new(ReportFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let archive = ReportArchive::new(config.archive_dir());

        let mut jobs = Vec::new();
        for network in registry.enabled() {
            let source = network.source_system()?;
            let endpoint = network
                .endpoint(&config)
                .with_context(|| format!("resolving endpoint for {}", network.network))?;
            jobs.push(Arc::new(IngestionJob::new(
                adapter_for(network, source),
                endpoint,
                network.cron.clone(),
                store.clone(),
                http.clone(),
                archive.clone(),
            )));
        }
        info!(networks = jobs.len(), "sync service configured");
        Ok(Self { config, jobs })
    }

    pub fn with_jobs(config: SyncConfig, jobs: Vec<Arc<IngestionJob>>) -> Self {
        Self { config, jobs }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn networks(&self) -> Vec<SourceSystem> {
        self.jobs.iter().map(|j| j.source_system()).collect()
    }

    pub fn default_window(&self) -> DateWindow {
        DateWindow::trailing_days(Utc::now().date_naive(), self.config.lookback_days)
    }

    /// Runs every configured network (or only `only`) concurrently over
    /// `window`. Each network is its own task, so one failure never blocks
    /// another. Writes `reports/<run_id>/ingest_summary.json`.
    pub async fn run_all_once(
        &self,
        window: DateWindow,
        only: Option<SourceSystem>,
    ) -> Result<IngestRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ctx = AdapterContext {
            run_id,
            started_at,
            window,
        };

        let mut handles = Vec::new();
        for job in &self.jobs {
            if only.is_some_and(|s| s != job.source_system()) {
                continue;
            }
            let job = job.clone();
            let ctx = ctx.clone();
            let network = job.source_system();
            handles.push((
                network,
                tokio::spawn(async move { job.run_once(&ctx).await }),
            ));
        }
        if handles.is_empty() {
            warn!(?only, "no enabled network matched this run");
        }

        let mut networks = Vec::new();
        for (network, handle) in handles {
            let summary = match handle.await {
                Ok(Ok(outcome)) => NetworkRunSummary {
                    network,
                    status: match &outcome {
                        IngestOutcome::Completed(_) => "completed",
                        IngestOutcome::AuthFailed { .. } => "auth_failed",
                    }
                    .to_string(),
                    outcome: Some(outcome),
                    error: None,
                },
                Ok(Err(err)) => NetworkRunSummary {
                    network,
                    status: "error".to_string(),
                    outcome: None,
                    error: Some(format!("{err:#}")),
                },
                Err(join_err) => {
                    error!(network = network.slug(), error = %join_err, "ingestion task aborted");
                    NetworkRunSummary {
                        network,
                        status: "error".to_string(),
                        outcome: None,
                        error: Some(join_err.to_string()),
                    }
                }
            };
            networks.push(summary);
        }

        let finished_at = Utc::now();
        let mut summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at,
            window,
            networks,
            summary_path: String::new(),
        };
        let path = write_run_summary(&self.config.reports_dir(), &mut summary).await?;
        info!(
            %run_id,
            networks = summary.networks.len(),
            failed = summary.failed_networks().count(),
            summary = %path.display(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// One cron job per network, each on its own schedule. `None` when the
    /// scheduler is disabled.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }

    pub async fn build_scheduler(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for job in &self.jobs {
            let cron = job.cron().to_string();
            let network = job.source_system();
            let lookback_days = self.config.lookback_days;
            let job = job.clone();
            let scheduled = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let job = job.clone();
                Box::pin(async move {
                    let ctx = AdapterContext {
                        run_id: Uuid::new_v4(),
                        started_at: Utc::now(),
                        window: DateWindow::trailing_days(Utc::now().date_naive(), lookback_days),
                    };
                    if let Err(err) = job.run_once(&ctx).await {
                        warn!(
                            network = network.slug(),
                            error = %format!("{err:#}"),
                            "scheduled ingestion failed"
                        );
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for {} ({cron})", network.slug()))?;
            sched.add(scheduled).await.context("adding scheduler job")?;
            info!(network = network.slug(), %cron, "scheduled ingestion");
        }
        Ok(sched)
    }
}

async fn write_run_summary(reports_root: &Path, summary: &mut IngestRunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("ingest_summary.json");
    summary.summary_path = path.display().to_string();
    let json = serde_json::to_vec_pretty(summary).context("serializing ingest summary")?;
    fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
