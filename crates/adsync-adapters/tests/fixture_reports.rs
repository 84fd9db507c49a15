use std::path::PathBuf;

use adsync_adapters::{adapter_for_source, AdapterContext, ReportEndpoint, MIXED_NETWORK};
use adsync_core::{DateWindow, RawFactRow, SourceSystem};
use adsync_storage::{HttpClientConfig, ReportFetcher};
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

fn fixture_path(source: SourceSystem) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source.slug())
        .join("sample.json")
}

async fn load(source: SourceSystem) -> Vec<RawFactRow> {
    let http = ReportFetcher::new(HttpClientConfig::default()).expect("fetcher");
    let ctx = AdapterContext {
        run_id: Uuid::new_v4(),
        started_at: Utc::now(),
        window: DateWindow::new(
            NaiveDate::from_ymd_opt(2026, 3, 1).expect("date"),
            NaiveDate::from_ymd_opt(2026, 3, 3).expect("date"),
        )
        .expect("window"),
    };
    let adapter = adapter_for_source(source);
    let endpoint = ReportEndpoint::Fixture {
        path: fixture_path(source),
    };
    let report = adapter
        .fetch_report(&http, &ctx, &endpoint)
        .await
        .expect("fixture fetch");
    assert_eq!(report.source_system, source);
    adapter.parse_report(&report).expect("fixture parse")
}

#[tokio::test]
async fn google_ads_fixture_collapses_network_segments() {
    let rows = load(SourceSystem::GoogleAds).await;
    assert_eq!(rows.len(), 4);

    let brand: Vec<_> = rows.iter().filter(|r| r.campaign_id == "123").collect();
    assert_eq!(brand.len(), 2);
    assert!(brand.iter().all(|r| r.network.as_deref() == Some("Search")));

    let mixed_day = rows
        .iter()
        .find(|r| r.campaign_id == "456" && r.date.to_string() == "2026-03-02")
        .expect("456 on 03-02");
    assert_eq!(mixed_day.network.as_deref(), Some(MIXED_NETWORK));
    assert_eq!(mixed_day.metrics.impressions, 19_873 + 3_120);
    assert_eq!(mixed_day.metrics.cost_micros, 24_150_000);
}

#[tokio::test]
async fn bing_ads_fixture_keeps_network_labels() {
    let rows = load(SourceSystem::BingAds).await;
    assert_eq!(rows.len(), 3);
    let partner = rows
        .iter()
        .find(|r| r.campaign_id == "7002")
        .expect("7002");
    assert_eq!(partner.network.as_deref(), Some("Syndicated search partners"));
    assert_eq!(partner.metrics.impressions, 1_204);
    assert_eq!(partner.metrics.cost_micros, 22_900_000);
}

#[tokio::test]
async fn tracker_fixtures_have_no_network_dimension() {
    for source in [SourceSystem::RedTrack, SourceSystem::Matomo] {
        let rows = load(source).await;
        assert_eq!(rows.len(), 3, "{source}");
        assert!(rows.iter().all(|r| r.network.is_none()), "{source}");
    }
}

#[tokio::test]
async fn missing_fixture_is_an_io_error() {
    let http = ReportFetcher::new(HttpClientConfig::default()).expect("fetcher");
    let ctx = AdapterContext {
        run_id: Uuid::new_v4(),
        started_at: Utc::now(),
        window: DateWindow::trailing_days(Utc::now().date_naive(), 1),
    };
    let err = adapter_for_source(SourceSystem::RedTrack)
        .fetch_report(
            &http,
            &ctx,
            &ReportEndpoint::Fixture {
                path: PathBuf::from("/nonexistent/report.json"),
            },
        )
        .await
        .expect_err("missing file");
    assert!(matches!(err, adsync_adapters::AdapterError::Io { .. }));
}
