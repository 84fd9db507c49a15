//! Postgres reconciliation store plus report fetch/archive utilities.
//!
//! The relational store is the only coordination point between the
//! independent per-network ingestion jobs, so every write here is a single
//! atomic statement or an explicit transaction.

mod archive;
mod facts;
mod fetch;
mod mapping;
mod performance;
pub mod schema;
mod status;

use std::time::Duration;

use adsync_core::{
    CampaignMapping, DateWindow, DisplayUpdate, InvalidCampaignId, RawFactRow, SourceSystem,
    StatusEntry,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

pub use archive::{ArchivedReport, ReportArchive};
pub use facts::{commit_report, upsert_facts, CommitOutcome};
pub use fetch::{
    classify_response, is_transient_transport_error, FetchError, FetchedResponse,
    HttpClientConfig, ReportFetcher, ReportRequest, ResponseClass, RetryPolicy,
};
pub use mapping::{
    backfill_network, clear_network, ensure_mapping, get_mapping, list_mappings, set_display,
    supersede_mapping, MappingFilter,
};
pub use performance::{campaign_performance, PerformanceReport};
pub use schema::{apply_migrations, schema_snapshot, MigrationReport, SchemaSnapshot};
pub use status::{get_status, list_statuses, set_status};

pub const CRATE_NAME: &str = "adsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    /// A schema step met already-migrated state. Absorbed by the migration
    /// runner; never returned from `apply_migrations`.
    #[error("schema step {step} already satisfied: {detail}")]
    SchemaConflict { step: String, detail: String },
    #[error(transparent)]
    InvalidCampaignId(#[from] InvalidCampaignId),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Pool-backed handle exposing every store operation.
#[derive(Debug, Clone)]
pub struct ReconStore {
    pool: PgPool,
}

impl ReconStore {
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<MigrationReport> {
        apply_migrations(&self.pool).await
    }

    pub async fn ensure_mapping(
        &self,
        source: SourceSystem,
        external_campaign_id: &str,
    ) -> StoreResult<i64> {
        ensure_mapping(&self.pool, source, external_campaign_id).await
    }

    pub async fn backfill_network(&self, source: SourceSystem) -> StoreResult<u64> {
        backfill_network(&self.pool, source).await
    }

    pub async fn set_display(
        &self,
        mapping_id: i64,
        update: &DisplayUpdate,
    ) -> StoreResult<CampaignMapping> {
        set_display(&self.pool, mapping_id, update).await
    }

    pub async fn supersede_mapping(
        &self,
        mapping_id: i64,
        update: &DisplayUpdate,
    ) -> StoreResult<CampaignMapping> {
        supersede_mapping(&self.pool, mapping_id, update).await
    }

    pub async fn clear_network(&self, mapping_id: i64) -> StoreResult<CampaignMapping> {
        clear_network(&self.pool, mapping_id).await
    }

    pub async fn get_mapping(&self, mapping_id: i64) -> StoreResult<CampaignMapping> {
        get_mapping(&self.pool, mapping_id).await
    }

    pub async fn list_mappings(&self, filter: &MappingFilter) -> StoreResult<Vec<CampaignMapping>> {
        list_mappings(&self.pool, filter).await
    }

    pub async fn set_status(&self, key: &str, value: &str) -> StoreResult<StatusEntry> {
        set_status(&self.pool, key, value).await
    }

    pub async fn get_status(&self, key: &str) -> StoreResult<StatusEntry> {
        get_status(&self.pool, key).await
    }

    pub async fn list_statuses(&self) -> StoreResult<Vec<StatusEntry>> {
        list_statuses(&self.pool).await
    }

    pub async fn commit_report(
        &self,
        source: SourceSystem,
        rows: &[RawFactRow],
    ) -> StoreResult<CommitOutcome> {
        commit_report(&self.pool, source, rows).await
    }

    pub async fn campaign_performance(
        &self,
        window: DateWindow,
        source: Option<SourceSystem>,
    ) -> StoreResult<PerformanceReport> {
        campaign_performance(&self.pool, window, source).await
    }
}
