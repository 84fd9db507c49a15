//! One network's ingestion pass: fetch, archive, commit, backfill, report.

use std::sync::Arc;

use adsync_adapters::{AdapterContext, AdapterError, NetworkAdapter, ReportEndpoint};
use adsync_core::{RawFactRow, SourceSystem, STATUS_ERROR, STATUS_FAILED, STATUS_OK};
use adsync_storage::{CommitOutcome, ReconStore, ReportArchive, ReportFetcher, StoreResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

/// The store operations an ingestion pass needs.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn set_status(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn commit_report(
        &self,
        source: SourceSystem,
        rows: &[RawFactRow],
    ) -> StoreResult<CommitOutcome>;
    async fn backfill_network(&self, source: SourceSystem) -> StoreResult<u64>;
}

#[async_trait]
impl IngestStore for ReconStore {
    async fn set_status(&self, key: &str, value: &str) -> StoreResult<()> {
        ReconStore::set_status(self, key, value).await.map(|_| ())
    }

    async fn commit_report(
        &self,
        source: SourceSystem,
        rows: &[RawFactRow],
    ) -> StoreResult<CommitOutcome> {
        ReconStore::commit_report(self, source, rows).await
    }

    async fn backfill_network(&self, source: SourceSystem) -> StoreResult<u64> {
        ReconStore::backfill_network(self, source).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub network: SourceSystem,
    pub rows_parsed: usize,
    pub facts_upserted: u64,
    pub mappings_touched: usize,
    pub networks_backfilled: u64,
    pub archived_report: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Completed(IngestReport),
    AuthFailed { network: SourceSystem, detail: String },
}

pub struct IngestionJob {
    adapter: Box<dyn NetworkAdapter>,
    endpoint: ReportEndpoint,
    cron: String,
    store: Arc<dyn IngestStore>,
    http: Arc<ReportFetcher>,
    archive: ReportArchive,
}

impl IngestionJob {
    pub fn new(
        adapter: Box<dyn NetworkAdapter>,
        endpoint: ReportEndpoint,
        cron: impl Into<String>,
        store: Arc<dyn IngestStore>,
        http: Arc<ReportFetcher>,
        archive: ReportArchive,
    ) -> Self {
        Self {
            adapter,
            endpoint,
            cron: cron.into(),
            store,
            http,
            archive,
        }
    }

    pub fn source_system(&self) -> SourceSystem {
        self.adapter.source_system()
    }

    pub fn cron(&self) -> &str {
        &self.cron
    }

    /// Runs one pass. Credential rejection is an outcome, not an error; any
    /// other failure marks `<slug>_last_run_status` as `error` and propagates.
    pub async fn run_once(&self, ctx: &AdapterContext) -> Result<IngestOutcome> {
        let source = self.source_system();
        let span = info_span!("ingest", run_id = %ctx.run_id, network = source.slug());
        async {
            match self.ingest(ctx).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "ingestion failed");
                    if let Err(status_err) = self
                        .store
                        .set_status(&source.last_run_status_key(), STATUS_ERROR)
                        .await
                    {
                        warn!(error = %status_err, "could not record failed run status");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn ingest(&self, ctx: &AdapterContext) -> Result<IngestOutcome> {
        let source = self.source_system();

        let report = match self
            .adapter
            .fetch_report(&self.http, ctx, &self.endpoint)
            .await
        {
            Ok(report) => report,
            Err(AdapterError::Auth { detail, .. }) => {
                warn!(%detail, "credentials rejected; skipping fact writes");
                self.store
                    .set_status(&source.auth_status_key(), STATUS_FAILED)
                    .await
                    .context("recording auth failure")?;
                return Ok(IngestOutcome::AuthFailed {
                    network: source,
                    detail,
                });
            }
            Err(err) => return Err(err).context("fetching report"),
        };
        self.store
            .set_status(&source.auth_status_key(), STATUS_OK)
            .await
            .context("recording auth success")?;

        let archived = self
            .archive
            .store_report(report.fetched_at, source.slug(), &report.body)
            .await
            .context("archiving raw report")?;
        let rows = self.adapter.parse_report(&report)?;
        let commit = self
            .store
            .commit_report(source, &rows)
            .await
            .context("committing report")?;
        let backfilled = self
            .store
            .backfill_network(source)
            .await
            .context("backfilling mapping networks")?;

        let finished_at = Utc::now();
        self.store
            .set_status(&source.last_ingest_key(), &finished_at.to_rfc3339())
            .await
            .context("recording last ingest time")?;
        self.store
            .set_status(&source.last_run_status_key(), STATUS_OK)
            .await
            .context("recording run status")?;

        info!(
            rows = rows.len(),
            facts = commit.facts_upserted,
            mappings = commit.mappings.len(),
            backfilled,
            archive = %archived.relative_path.display(),
            "ingestion complete"
        );
        Ok(IngestOutcome::Completed(IngestReport {
            network: source,
            rows_parsed: rows.len(),
            facts_upserted: commit.facts_upserted,
            mappings_touched: commit.mappings.len(),
            networks_backfilled: backfilled,
            archived_report: archived.relative_path.display().to_string(),
            finished_at,
        }))
    }
}
