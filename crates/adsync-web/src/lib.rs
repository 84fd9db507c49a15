//! Unified read API: array-shaped, versioned JSON over the mapping, status
//! and fact stores, plus the dashboard's display edits.

mod envelope;

use std::sync::Arc;

use adsync_core::{
    CampaignMapping, CampaignPerformance, DateWindow, DisplayUpdate, SourceSystem, StatusEntry,
};
use adsync_storage::{MappingFilter, PerformanceReport, ReconStore, StoreError, StoreResult};
use async_trait::async_trait;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path as AxumPath, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub use envelope::{
    decode_envelope, ApiEnvelope, Diagnostic, ShapeMismatch, SCHEMA_VERSION, UNMAPPED_CAMPAIGN,
};

pub const CRATE_NAME: &str = "adsync-web";
pub const DEFAULT_PORT: u16 = 8000;

pub const RESOURCE_HEALTH: &str = "health";
pub const RESOURCE_STATUS: &str = "status";
pub const RESOURCE_MAPPINGS: &str = "mappings";
pub const RESOURCE_PERFORMANCE: &str = "performance";

/// Read and display-edit operations the API needs from the store.
#[async_trait]
pub trait DashboardStore: Send + Sync {
    async fn list_statuses(&self) -> StoreResult<Vec<StatusEntry>>;
    async fn get_status(&self, key: &str) -> StoreResult<StatusEntry>;
    async fn list_mappings(&self, filter: MappingFilter) -> StoreResult<Vec<CampaignMapping>>;
    async fn set_display(
        &self,
        mapping_id: i64,
        update: &DisplayUpdate,
    ) -> StoreResult<CampaignMapping>;
    async fn supersede_mapping(
        &self,
        mapping_id: i64,
        update: &DisplayUpdate,
    ) -> StoreResult<CampaignMapping>;
    async fn campaign_performance(
        &self,
        window: DateWindow,
        source: Option<SourceSystem>,
    ) -> StoreResult<PerformanceReport>;
}

#[async_trait]
impl DashboardStore for ReconStore {
    async fn list_statuses(&self) -> StoreResult<Vec<StatusEntry>> {
        ReconStore::list_statuses(self).await
    }

    async fn get_status(&self, key: &str) -> StoreResult<StatusEntry> {
        ReconStore::get_status(self, key).await
    }

    async fn list_mappings(&self, filter: MappingFilter) -> StoreResult<Vec<CampaignMapping>> {
        ReconStore::list_mappings(self, &filter).await
    }

    async fn set_display(
        &self,
        mapping_id: i64,
        update: &DisplayUpdate,
    ) -> StoreResult<CampaignMapping> {
        ReconStore::set_display(self, mapping_id, update).await
    }

    async fn supersede_mapping(
        &self,
        mapping_id: i64,
        update: &DisplayUpdate,
    ) -> StoreResult<CampaignMapping> {
        ReconStore::supersede_mapping(self, mapping_id, update).await
    }

    async fn campaign_performance(
        &self,
        window: DateWindow,
        source: Option<SourceSystem>,
    ) -> StoreResult<PerformanceReport> {
        ReconStore::campaign_performance(self, window, source).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DashboardStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn DashboardStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub service: String,
    pub status: String,
    pub database: String,
}

#[derive(Debug, Deserialize, Default)]
struct MappingsQuery {
    source: Option<String>,
    #[serde(default)]
    include_superseded: bool,
}

#[derive(Debug, Deserialize, Default)]
struct PerformanceQuery {
    from: Option<String>,
    to: Option<String>,
    source: Option<String>,
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    schema_version: u32,
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            ApiError::NotFound(err.to_string())
        } else {
            error!(error = %err, "store request failed");
            ApiError::Internal(err.to_string())
        }
    }
}

/// Extractor rejections keep the JSON error shape instead of axum's plain text.
macro_rules! bad_request_from {
    ($($rejection:ty),+) => {
        $(impl From<$rejection> for ApiError {
            fn from(rejection: $rejection) -> Self {
                ApiError::BadRequest(rejection.body_text())
            }
        })+
    };
}

bad_request_from!(JsonRejection, PathRejection, QueryRejection);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        };
        let body = ErrorBody {
            schema_version: SCHEMA_VERSION,
            error: ErrorDetail { kind, message },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiEnvelope<T>>, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/status", get(list_status_handler))
        .route("/api/v1/status/{key}", get(status_handler))
        .route("/api/v1/mappings", get(list_mappings_handler))
        .route("/api/v1/mappings/{id}", patch(set_display_handler))
        .route("/api/v1/mappings/{id}/supersede", post(supersede_handler))
        .route("/api/v1/performance", get(performance_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("ADSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<ApiEnvelope<HealthCheck>> {
    let (status, database) = match state.store.list_statuses().await {
        Ok(_) => ("ok", "ok"),
        Err(err) => {
            warn!(error = %err, "health check could not reach the store");
            ("degraded", "unreachable")
        }
    };
    Json(ApiEnvelope::new(
        RESOURCE_HEALTH,
        vec![HealthCheck {
            service: CRATE_NAME.to_string(),
            status: status.to_string(),
            database: database.to_string(),
        }],
    ))
}

async fn list_status_handler(State(state): State<Arc<AppState>>) -> ApiResult<StatusEntry> {
    let entries = state.store.list_statuses().await?;
    Ok(Json(ApiEnvelope::new(RESOURCE_STATUS, entries)))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    key: Result<AxumPath<String>, PathRejection>,
) -> ApiResult<StatusEntry> {
    let AxumPath(key) = key?;
    let entry = state.store.get_status(&key).await?;
    Ok(Json(ApiEnvelope::new(RESOURCE_STATUS, vec![entry])))
}

async fn list_mappings_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<MappingsQuery>, QueryRejection>,
) -> ApiResult<CampaignMapping> {
    let Query(query) = query?;
    let filter = MappingFilter {
        source: parse_source(query.source.as_deref())?,
        include_superseded: query.include_superseded,
    };
    let mappings = state.store.list_mappings(filter).await?;
    Ok(Json(ApiEnvelope::new(RESOURCE_MAPPINGS, mappings)))
}

async fn set_display_handler(
    State(state): State<Arc<AppState>>,
    id: Result<AxumPath<i64>, PathRejection>,
    update: Result<Json<DisplayUpdate>, JsonRejection>,
) -> ApiResult<CampaignMapping> {
    let AxumPath(id) = id?;
    let Json(update) = update?;
    if update.is_empty() {
        return Err(ApiError::BadRequest(
            "display update names no fields".to_string(),
        ));
    }
    let mapping = state.store.set_display(id, &update).await?;
    info!(mapping_id = id, "display attributes updated");
    Ok(Json(ApiEnvelope::new(RESOURCE_MAPPINGS, vec![mapping])))
}

async fn supersede_handler(
    State(state): State<Arc<AppState>>,
    id: Result<AxumPath<i64>, PathRejection>,
    update: Result<Json<DisplayUpdate>, JsonRejection>,
) -> ApiResult<CampaignMapping> {
    let AxumPath(id) = id?;
    let Json(update) = update?;
    let replacement = state.store.supersede_mapping(id, &update).await?;
    info!(
        mapping_id = id,
        replacement_id = replacement.id,
        "mapping superseded"
    );
    Ok(Json(ApiEnvelope::new(RESOURCE_MAPPINGS, vec![replacement])))
}

async fn performance_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PerformanceQuery>, QueryRejection>,
) -> ApiResult<CampaignPerformance> {
    let Query(query) = query?;
    let start = parse_date("from", query.from.as_deref())?;
    let end = parse_date("to", query.to.as_deref())?;
    let window = DateWindow::new(start, end).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let source = parse_source(query.source.as_deref())?;

    let report = state.store.campaign_performance(window, source).await?;
    let diagnostics = report
        .unmapped
        .iter()
        .map(|campaign| {
            warn!(
                network = %campaign.source_system,
                campaign_id = %campaign.external_campaign_id,
                "fact campaign has no active mapping"
            );
            Diagnostic::unmapped(campaign)
        })
        .collect();
    Ok(Json(
        ApiEnvelope::new(RESOURCE_PERFORMANCE, report.rows).with_diagnostics(diagnostics),
    ))
}

fn parse_source(raw: Option<&str>) -> Result<Option<SourceSystem>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<SourceSystem>()
            .map(Some)
            .map_err(|e| ApiError::BadRequest(e.to_string())),
    }
}

fn parse_date(name: &str, raw: Option<&str>) -> Result<NaiveDate, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing `{name}` date")))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("`{name}` must be YYYY-MM-DD, got {raw:?}")))
}
