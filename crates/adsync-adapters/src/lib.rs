//! Per-network report adapters: fetch a raw report, parse it into fact rows.

mod bing;
mod google;
mod matomo;
mod redtrack;
mod values;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use adsync_core::{
    normalize_campaign_id, DateWindow, FactMetrics, RawFactRow, SourceSystem,
};
use adsync_storage::{FetchError, ReportFetcher, ReportRequest};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use bing::BingAdsAdapter;
pub use google::GoogleAdsAdapter;
pub use matomo::MatomoAdapter;
pub use redtrack::RedTrackAdapter;
pub use values::parse_money_micros;

pub const CRATE_NAME: &str = "adsync-adapters";

/// Network label used when one campaign-day spans several ad networks.
pub const MIXED_NETWORK: &str = "Cross-network";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub window: DateWindow,
}

/// Where a report comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEndpoint {
    /// A captured report on disk; never needs credentials.
    Fixture { path: PathBuf },
    Api {
        url: String,
        access_token: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedReport {
    pub source_system: SourceSystem,
    /// URL or fixture path the body was read from.
    pub origin: String,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{network} rejected credentials: {detail}")]
    Auth {
        network: SourceSystem,
        detail: String,
    },
    #[error("fetching {network} report")]
    Fetch {
        network: SourceSystem,
        #[source]
        source: FetchError,
    },
    #[error("parsing {network} report: {detail}")]
    Parse {
        network: SourceSystem,
        detail: String,
    },
    #[error("reading report fixture {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AdapterError {
    pub fn is_auth(&self) -> bool {
        matches!(self, AdapterError::Auth { .. })
    }

    pub(crate) fn parse(network: SourceSystem, detail: impl Into<String>) -> Self {
        AdapterError::Parse {
            network,
            detail: detail.into(),
        }
    }
}

/// How an API credential is attached to a report request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPlacement {
    Bearer,
    Query(&'static str),
}

#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    fn source_system(&self) -> SourceSystem;

    fn token_placement(&self) -> TokenPlacement {
        TokenPlacement::Bearer
    }

    /// Query parameters selecting the report window.
    fn report_query(&self, window: &DateWindow) -> Vec<(&'static str, String)> {
        vec![
            ("start_date", window.start.to_string()),
            ("end_date", window.end.to_string()),
        ]
    }

    async fn fetch_report(
        &self,
        http: &ReportFetcher,
        ctx: &AdapterContext,
        endpoint: &ReportEndpoint,
    ) -> Result<FetchedReport, AdapterError> {
        fetch_endpoint(
            self.source_system(),
            self.token_placement(),
            self.report_query(&ctx.window),
            http,
            ctx,
            endpoint,
        )
        .await
    }

    fn parse_report(&self, report: &FetchedReport) -> Result<Vec<RawFactRow>, AdapterError>;
}

/// Shared fetch path: fixtures are read from disk, API endpoints go through
/// the rate-limited fetcher. A missing token or a 401/403 is an auth failure.
pub async fn fetch_endpoint(
    network: SourceSystem,
    placement: TokenPlacement,
    mut query: Vec<(&'static str, String)>,
    http: &ReportFetcher,
    ctx: &AdapterContext,
    endpoint: &ReportEndpoint,
) -> Result<FetchedReport, AdapterError> {
    match endpoint {
        ReportEndpoint::Fixture { path } => {
            let body = fs::read(path).map_err(|source| AdapterError::Io {
                path: path.clone(),
                source,
            })?;
            Ok(FetchedReport {
                source_system: network,
                origin: path.display().to_string(),
                fetched_at: ctx.started_at,
                body,
            })
        }
        ReportEndpoint::Api { url, access_token } => {
            let token = access_token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| AdapterError::Auth {
                    network,
                    detail: "no access token configured".to_string(),
                })?;

            let bearer_token = match placement {
                TokenPlacement::Bearer => Some(token),
                TokenPlacement::Query(param) => {
                    query.push((param, token.to_string()));
                    None
                }
            };
            let request = ReportRequest {
                network: network.slug(),
                url,
                bearer_token,
                query,
            };

            match http.fetch_report(ctx.run_id, &request).await {
                Ok(response) => Ok(FetchedReport {
                    source_system: network,
                    origin: response.final_url,
                    fetched_at: Utc::now(),
                    body: response.body,
                }),
                Err(FetchError::Unauthorized { status, url }) => Err(AdapterError::Auth {
                    network,
                    detail: format!("http {status} from {url}"),
                }),
                Err(source) => Err(AdapterError::Fetch { network, source }),
            }
        }
    }
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    network: SourceSystem,
    report: &FetchedReport,
) -> Result<T, AdapterError> {
    serde_json::from_slice(&report.body).map_err(|e| AdapterError::parse(network, e.to_string()))
}

pub(crate) fn campaign_id(network: SourceSystem, raw: &str) -> Result<String, AdapterError> {
    normalize_campaign_id(network.fact_table().id_kind, raw)
        .map_err(|e| AdapterError::parse(network, e.to_string()))
}

pub(crate) fn parse_report_date(network: SourceSystem, raw: &str) -> Result<NaiveDate, AdapterError> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .map_err(|_| AdapterError::parse(network, format!("unrecognized date {raw:?}")))
}

/// Merges rows sharing `(campaign_id, date)`; the fact tables hold one row
/// per campaign-day. Differing networks collapse to [`MIXED_NETWORK`].
pub fn collapse_campaign_days(rows: Vec<RawFactRow>) -> Vec<RawFactRow> {
    let mut merged: BTreeMap<(String, NaiveDate), RawFactRow> = BTreeMap::new();
    for row in rows {
        match merged.get_mut(&(row.campaign_id.clone(), row.date)) {
            Some(existing) => {
                existing.metrics.accumulate(&row.metrics);
                if existing.campaign_name.is_none() {
                    existing.campaign_name = row.campaign_name;
                }
                existing.network = match (existing.network.take(), row.network) {
                    (Some(a), Some(b)) if a != b => Some(MIXED_NETWORK.to_string()),
                    (a, b) => a.or(b),
                };
            }
            None => {
                merged.insert((row.campaign_id.clone(), row.date), row);
            }
        }
    }
    merged.into_values().collect()
}

pub(crate) fn fact_row(
    campaign_id: String,
    campaign_name: Option<String>,
    date: NaiveDate,
    network: Option<String>,
    metrics: FactMetrics,
) -> RawFactRow {
    RawFactRow {
        campaign_id,
        campaign_name,
        date,
        network,
        metrics,
    }
}

pub fn adapter_for_source(source: SourceSystem) -> Box<dyn NetworkAdapter> {
    match source {
        SourceSystem::GoogleAds => Box::new(GoogleAdsAdapter),
        SourceSystem::BingAds => Box::new(BingAdsAdapter),
        SourceSystem::RedTrack => Box::new(RedTrackAdapter),
        SourceSystem::Matomo => Box::new(MatomoAdapter::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, day: u32, network: Option<&str>, clicks: i64) -> RawFactRow {
        fact_row(
            id.to_string(),
            None,
            NaiveDate::from_ymd_opt(2026, 3, day).expect("date"),
            network.map(str::to_string),
            FactMetrics {
                clicks,
                ..FactMetrics::default()
            },
        )
    }

    #[test]
    fn collapse_sums_metrics_and_marks_mixed_networks() {
        let rows = collapse_campaign_days(vec![
            row("1", 1, Some("Search"), 2),
            row("1", 1, Some("Display"), 3),
            row("1", 2, None, 1),
            row("1", 2, Some("Search"), 1),
            row("2", 1, Some("Search"), 9),
        ]);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].metrics.clicks, 5);
        assert_eq!(rows[0].network.as_deref(), Some(MIXED_NETWORK));
        assert_eq!(rows[1].network.as_deref(), Some("Search"));
        assert_eq!(rows[2].campaign_id, "2");
    }

    #[test]
    fn report_dates_accept_iso_and_us_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 3, 4).expect("date");
        assert_eq!(
            parse_report_date(SourceSystem::BingAds, "2026-03-04").expect("iso"),
            expected
        );
        assert_eq!(
            parse_report_date(SourceSystem::BingAds, "3/4/2026").expect("us"),
            expected
        );
        assert!(parse_report_date(SourceSystem::BingAds, "yesterday").is_err());
    }

    #[test]
    fn every_source_has_an_adapter() {
        for source in SourceSystem::ALL {
            assert_eq!(adapter_for_source(source).source_system(), source);
        }
    }

    #[tokio::test]
    async fn api_endpoint_without_token_is_an_auth_failure() {
        let http = ReportFetcher::new(Default::default()).expect("fetcher");
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            window: DateWindow::trailing_days(Utc::now().date_naive(), 7),
        };
        let endpoint = ReportEndpoint::Api {
            url: "http://127.0.0.1:9/report".to_string(),
            access_token: Some("   ".to_string()),
        };

        let err = GoogleAdsAdapter
            .fetch_report(&http, &ctx, &endpoint)
            .await
            .expect_err("blank token");
        assert!(err.is_auth());
    }
}
