// Postgres-backed store tests. Each test migrates into its own schema.
// Skipped unless ADSYNC_TEST_DATABASE_URL points at a reachable server.

use std::time::Duration;

use adsync_core::{
    dashboard_order, DateWindow, DisplayUpdate, FactMetrics, RawFactRow, SourceSystem,
};
use adsync_storage::{schema_snapshot, MappingFilter, ReconStore};
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;

async fn isolated_store(label: &str) -> Option<ReconStore> {
    let Ok(url) = std::env::var("ADSYNC_TEST_DATABASE_URL") else {
        eprintln!("ADSYNC_TEST_DATABASE_URL unset; skipping {label}");
        return None;
    };
    let schema = format!("adsync_test_{label}_{}", uuid::Uuid::new_v4().simple());

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("connect admin pool");
    admin
        .execute(format!("CREATE SCHEMA {schema}").as_str())
        .await
        .expect("create test schema");
    admin.close().await;

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .after_connect(move |conn, _meta| {
            let set_path = format!("SET search_path TO {schema}");
            Box::pin(async move {
                conn.execute(set_path.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("connect test pool");

    let store = ReconStore::from_pool(pool);
    store.migrate().await.expect("migrate");
    Some(store)
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).expect("valid date")
}

fn fact(campaign_id: &str, date: NaiveDate, network: Option<&str>, clicks: i64) -> RawFactRow {
    RawFactRow {
        campaign_id: campaign_id.to_string(),
        campaign_name: Some(format!("Campaign {campaign_id}")),
        date,
        network: network.map(str::to_string),
        metrics: FactMetrics {
            impressions: clicks * 10,
            clicks,
            cost_micros: clicks * 250_000,
            conversions: 0.5,
            revenue_micros: 0,
        },
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_ensure_mapping_converges_on_one_row() {
    let Some(store) = isolated_store("race").await else {
        return;
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.ensure_mapping(SourceSystem::GoogleAds, "123").await
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("join").expect("ensure_mapping"));
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let mappings = store
        .list_mappings(&MappingFilter {
            source: Some(SourceSystem::GoogleAds),
            include_superseded: true,
        })
        .await
        .expect("list");
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].external_campaign_id, "123");
    assert_eq!(mappings[0].network, None);
}

#[tokio::test]
async fn ensure_mapping_normalizes_numeric_ids() {
    let Some(store) = isolated_store("normalize").await else {
        return;
    };

    let first = store
        .ensure_mapping(SourceSystem::BingAds, " 0042 ")
        .await
        .expect("first");
    let second = store
        .ensure_mapping(SourceSystem::BingAds, "42")
        .await
        .expect("second");
    assert_eq!(first, second);

    let err = store
        .ensure_mapping(SourceSystem::GoogleAds, "abc")
        .await
        .expect_err("non-numeric google id");
    assert!(matches!(err, adsync_storage::StoreError::InvalidCampaignId(_)));
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let Some(store) = isolated_store("migrate").await else {
        return;
    };

    let before = schema_snapshot(store.pool()).await.expect("snapshot");
    let report = store.migrate().await.expect("second migrate");
    let after = schema_snapshot(store.pool()).await.expect("snapshot");

    assert_eq!(before, after);
    assert_eq!(report.applied_ops, 0);
    assert!(report.newly_recorded.is_empty());
    assert_eq!(after.recorded_versions, (1..=8).collect::<Vec<_>>());
    assert!(!after
        .constraints
        .iter()
        .any(|c| c == "campaign_mapping_business_key"));
    assert!(after
        .indexes
        .iter()
        .any(|i| i == "campaign_mapping_active_pair"));
    assert!(after
        .triggers
        .iter()
        .any(|t| t == "system_status_refresh_updated_at"));
}

#[tokio::test]
async fn backfill_fills_latest_network_once() {
    let Some(store) = isolated_store("backfill").await else {
        return;
    };

    let rows = vec![
        fact("123", day(1), Some("Display"), 3),
        fact("123", day(2), Some("Search"), 5),
        fact("456", day(2), None, 1),
    ];
    let outcome = store
        .commit_report(SourceSystem::GoogleAds, &rows)
        .await
        .expect("commit");
    assert_eq!(outcome.mappings.len(), 2);

    assert_eq!(
        store
            .backfill_network(SourceSystem::GoogleAds)
            .await
            .expect("backfill"),
        1
    );
    assert_eq!(
        store
            .backfill_network(SourceSystem::GoogleAds)
            .await
            .expect("second backfill"),
        0
    );

    let mapping = store
        .get_mapping(outcome.mappings["123"])
        .await
        .expect("mapping");
    assert_eq!(mapping.network.as_deref(), Some("Search"));
    let without = store
        .get_mapping(outcome.mappings["456"])
        .await
        .expect("mapping");
    assert_eq!(without.network, None);
}

#[tokio::test]
async fn backfill_never_overwrites_a_set_network() {
    let Some(store) = isolated_store("nooverwrite").await else {
        return;
    };

    let outcome = store
        .commit_report(SourceSystem::BingAds, &[fact("77", day(1), Some("Search"), 2)])
        .await
        .expect("commit");
    store
        .backfill_network(SourceSystem::BingAds)
        .await
        .expect("backfill");

    store
        .commit_report(SourceSystem::BingAds, &[fact("77", day(5), Some("Audience"), 2)])
        .await
        .expect("second commit");
    assert_eq!(
        store
            .backfill_network(SourceSystem::BingAds)
            .await
            .expect("backfill"),
        0
    );
    let id = outcome.mappings["77"];
    assert_eq!(
        store.get_mapping(id).await.expect("get").network.as_deref(),
        Some("Search")
    );

    store.clear_network(id).await.expect("clear");
    store
        .backfill_network(SourceSystem::BingAds)
        .await
        .expect("refill");
    assert_eq!(
        store.get_mapping(id).await.expect("get").network.as_deref(),
        Some("Audience")
    );
}

#[tokio::test]
async fn sources_without_network_dimension_stay_null() {
    let Some(store) = isolated_store("nonetwork").await else {
        return;
    };

    let outcome = store
        .commit_report(SourceSystem::RedTrack, &[fact("rt-9", day(3), Some("ignored"), 4)])
        .await
        .expect("commit");
    assert_eq!(
        store
            .backfill_network(SourceSystem::RedTrack)
            .await
            .expect("backfill"),
        0
    );
    let mapping = store
        .get_mapping(outcome.mappings["rt-9"])
        .await
        .expect("mapping");
    assert_eq!(mapping.network, None);
}

#[tokio::test]
async fn status_updated_at_advances_on_every_write() {
    let Some(store) = isolated_store("status").await else {
        return;
    };

    let first = store
        .set_status("google_ads_auth_status", "ok")
        .await
        .expect("first");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = store
        .set_status("google_ads_auth_status", "ok")
        .await
        .expect("second");
    assert!(second.updated_at > first.updated_at);

    let read = store
        .get_status("google_ads_auth_status")
        .await
        .expect("get");
    assert_eq!(read, second);

    let missing = store.get_status("nope").await.expect_err("missing key");
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn display_updates_are_partial_and_blank_clears() {
    let Some(store) = isolated_store("display").await else {
        return;
    };

    let id = store
        .ensure_mapping(SourceSystem::Matomo, "newsletter")
        .await
        .expect("ensure");
    let updated = store
        .set_display(
            id,
            &DisplayUpdate {
                pretty_name: Some("Spring Newsletter".into()),
                display_order: Some(3),
                ..DisplayUpdate::default()
            },
        )
        .await
        .expect("set");
    assert_eq!(updated.pretty_name.as_deref(), Some("Spring Newsletter"));
    assert_eq!(updated.display_order, 3);

    let cleared = store
        .set_display(
            id,
            &DisplayUpdate {
                pretty_name: Some("  ".into()),
                ..DisplayUpdate::default()
            },
        )
        .await
        .expect("clear");
    assert_eq!(cleared.pretty_name, None);
    assert_eq!(cleared.display_order, 3);

    let err = store
        .set_display(999_999, &DisplayUpdate::default())
        .await
        .expect_err("unknown id");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn supersede_keeps_history_and_moves_the_active_row() {
    let Some(store) = isolated_store("supersede").await else {
        return;
    };

    let original = store
        .ensure_mapping(SourceSystem::GoogleAds, "900")
        .await
        .expect("ensure");
    let replacement = store
        .supersede_mapping(
            original,
            &DisplayUpdate {
                pretty_name: Some("Brand Search".into()),
                ..DisplayUpdate::default()
            },
        )
        .await
        .expect("supersede");
    assert_ne!(replacement.id, original);
    assert!(replacement.is_active());

    let retired = store.get_mapping(original).await.expect("retired");
    assert_eq!(retired.superseded_by, Some(replacement.id));

    assert_eq!(
        store
            .ensure_mapping(SourceSystem::GoogleAds, "900")
            .await
            .expect("ensure again"),
        replacement.id
    );

    let err = store
        .supersede_mapping(original, &DisplayUpdate::default())
        .await
        .expect_err("already superseded");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn performance_reports_unmapped_campaigns() {
    let Some(store) = isolated_store("performance").await else {
        return;
    };

    let committed = store
        .commit_report(SourceSystem::GoogleAds, &[fact("1", day(1), Some("Search"), 2)])
        .await
        .expect("commit");
    store
        .set_display(
            committed.mappings["1"],
            &DisplayUpdate {
                display_order: Some(5),
                ..DisplayUpdate::default()
            },
        )
        .await
        .expect("reorder");
    // Fact rows written without going through commit_report have no mapping.
    let mut conn = store.pool().acquire().await.expect("conn");
    adsync_storage::upsert_facts(
        &mut *conn,
        SourceSystem::RedTrack,
        &[fact("orphan", day(2), None, 7)],
    )
    .await
    .expect("raw upsert");
    drop(conn);

    let window = DateWindow::new(day(1), day(31)).expect("window");
    let report = store
        .campaign_performance(window, None)
        .await
        .expect("performance");
    assert_eq!(report.rows.len(), 2);
    assert_eq!(report.unmapped.len(), 1);
    assert_eq!(report.unmapped[0].source_system, SourceSystem::RedTrack);
    assert_eq!(report.unmapped[0].external_campaign_id, "orphan");
    // The unmapped campaign sorts at order 0, ahead of the reordered mapping.
    assert_eq!(report.rows[0].external_campaign_id, "orphan");
    assert_eq!(report.rows[1].display_order, 5);
    assert!(report
        .rows
        .windows(2)
        .all(|pair| dashboard_order(&pair[0], &pair[1]) != std::cmp::Ordering::Greater));

    let google_only = store
        .campaign_performance(window, Some(SourceSystem::GoogleAds))
        .await
        .expect("filtered");
    assert_eq!(google_only.rows.len(), 1);
    assert!(google_only.unmapped.is_empty());
    assert_eq!(google_only.rows[0].metrics.clicks, 2);
}
