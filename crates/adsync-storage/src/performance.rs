//! Cross-network performance aggregate joined to canonical identity.

use adsync_core::{
    dashboard_order, CampaignPerformance, DateWindow, FactMetrics, SourceSystem, UnmappedCampaign,
};
use sqlx::PgPool;
use tracing::warn;

use crate::{StoreError, StoreResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceReport {
    pub rows: Vec<CampaignPerformance>,
    pub unmapped: Vec<UnmappedCampaign>,
}

#[derive(Debug, sqlx::FromRow)]
struct PerformanceRecord {
    mapping_id: Option<i64>,
    source_system: String,
    external_campaign_id: String,
    display_name: String,
    campaign_name: Option<String>,
    network: Option<String>,
    pretty_network: Option<String>,
    pretty_source: Option<String>,
    display_order: i32,
    impressions: i64,
    clicks: i64,
    cost_micros: i64,
    conversions: f64,
    revenue_micros: i64,
}

fn fact_select(source: SourceSystem) -> String {
    format!(
        "SELECT '{label}'::text AS source_system, campaign_id::text AS external_campaign_id, \
         date, campaign_name, impressions, clicks, cost_micros, conversions, revenue_micros \
         FROM {table} WHERE date BETWEEN $1 AND $2",
        label = source.as_str(),
        table = source.fact_table().name,
    )
}

fn performance_sql(sources: &[SourceSystem]) -> String {
    let facts = sources
        .iter()
        .map(|s| fact_select(*s))
        .collect::<Vec<_>>()
        .join("\n UNION ALL\n ");
    format!(
        r#"
        WITH facts AS (
            {facts}
        ), agg AS (
            SELECT source_system,
                   external_campaign_id,
                   (array_agg(campaign_name ORDER BY date DESC)
                        FILTER (WHERE campaign_name IS NOT NULL))[1] AS campaign_name,
                   SUM(impressions)::BIGINT AS impressions,
                   SUM(clicks)::BIGINT AS clicks,
                   SUM(cost_micros)::BIGINT AS cost_micros,
                   SUM(conversions)::DOUBLE PRECISION AS conversions,
                   SUM(revenue_micros)::BIGINT AS revenue_micros
              FROM facts
             GROUP BY source_system, external_campaign_id
        )
        SELECT m.id AS mapping_id,
               agg.source_system,
               agg.external_campaign_id,
               COALESCE(m.pretty_name, agg.campaign_name, agg.external_campaign_id) AS display_name,
               agg.campaign_name,
               m.network,
               m.pretty_network,
               m.pretty_source,
               COALESCE(m.display_order, 0) AS display_order,
               agg.impressions,
               agg.clicks,
               agg.cost_micros,
               agg.conversions,
               agg.revenue_micros
          FROM agg
          LEFT JOIN campaign_mapping m
            ON m.source_system = agg.source_system
           AND m.external_campaign_id = agg.external_campaign_id
           AND m.superseded_by IS NULL
         ORDER BY display_order, display_name, agg.source_system, agg.external_campaign_id
        "#
    )
}

/// Aggregates every fact store (or one) over `window`. Campaigns without an
/// active mapping are kept in `rows` with `mapping_id = None` and listed in
/// `unmapped`.
pub async fn campaign_performance(
    pool: &PgPool,
    window: DateWindow,
    source: Option<SourceSystem>,
) -> StoreResult<PerformanceReport> {
    let sources = match source {
        Some(s) => vec![s],
        None => SourceSystem::ALL.to_vec(),
    };
    let records = sqlx::query_as::<_, PerformanceRecord>(&performance_sql(&sources))
        .bind(window.start)
        .bind(window.end)
        .fetch_all(pool)
        .await?;

    let mut report = PerformanceReport::default();
    for record in records {
        let source_system = record
            .source_system
            .parse::<SourceSystem>()
            .map_err(|e| StoreError::Corrupt {
                table: "campaign_mapping",
                detail: e.to_string(),
            })?;
        if record.mapping_id.is_none() {
            report.unmapped.push(UnmappedCampaign {
                source_system,
                external_campaign_id: record.external_campaign_id.clone(),
            });
        }
        report.rows.push(CampaignPerformance {
            mapping_id: record.mapping_id,
            source_system,
            external_campaign_id: record.external_campaign_id,
            display_name: record.display_name,
            campaign_name: record.campaign_name,
            network: record.network,
            pretty_network: record.pretty_network,
            pretty_source: record.pretty_source,
            display_order: record.display_order,
            metrics: FactMetrics {
                impressions: record.impressions,
                clicks: record.clicks,
                cost_micros: record.cost_micros,
                conversions: record.conversions,
                revenue_micros: record.revenue_micros,
            },
        });
    }

    // Final order is `dashboard_order`, independent of database collation.
    report.rows.sort_by(dashboard_order);
    report.unmapped.sort();

    if !report.unmapped.is_empty() {
        warn!(
            unmapped = report.unmapped.len(),
            "fact rows without an active campaign mapping"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn performance_sql_unions_only_requested_sources() {
        let sql = performance_sql(&[SourceSystem::GoogleAds, SourceSystem::Matomo]);
        assert!(sql.contains("FROM google_ads_fact"));
        assert!(sql.contains("FROM matomo_fact"));
        assert!(!sql.contains("bing_ads_fact"));
        assert_eq!(sql.matches("UNION ALL").count(), 1);
    }

    #[test]
    fn fact_select_casts_ids_to_text() {
        let sql = fact_select(SourceSystem::BingAds);
        assert!(sql.starts_with("SELECT 'Bing Ads'::text AS source_system, campaign_id::text"));
    }
}
