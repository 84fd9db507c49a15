//! Raw fact store writes.

use std::collections::BTreeMap;

use adsync_core::{
    distinct_campaign_ids, normalize_campaign_id, CampaignIdKind, FactTable, InvalidCampaignId,
    RawFactRow, SourceSystem,
};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tracing::info;

use crate::mapping::ensure_mapping;
use crate::StoreResult;

fn upsert_sql(table: FactTable) -> String {
    let name = table.name;
    if table.has_network {
        format!(
            r#"
            INSERT INTO {name} (
                campaign_id, date, campaign_name, network,
                impressions, clicks, cost_micros, conversions, revenue_micros
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (campaign_id, date) DO UPDATE SET
                campaign_name = COALESCE(EXCLUDED.campaign_name, {name}.campaign_name),
                network = COALESCE(EXCLUDED.network, {name}.network),
                impressions = EXCLUDED.impressions,
                clicks = EXCLUDED.clicks,
                cost_micros = EXCLUDED.cost_micros,
                conversions = EXCLUDED.conversions,
                revenue_micros = EXCLUDED.revenue_micros,
                ingested_at = now()
            "#
        )
    } else {
        format!(
            r#"
            INSERT INTO {name} (
                campaign_id, date, campaign_name,
                impressions, clicks, cost_micros, conversions, revenue_micros
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (campaign_id, date) DO UPDATE SET
                campaign_name = COALESCE(EXCLUDED.campaign_name, {name}.campaign_name),
                impressions = EXCLUDED.impressions,
                clicks = EXCLUDED.clicks,
                cost_micros = EXCLUDED.cost_micros,
                conversions = EXCLUDED.conversions,
                revenue_micros = EXCLUDED.revenue_micros,
                ingested_at = now()
            "#
        )
    }
}

fn bigint_id(campaign_id: &str) -> Result<i64, InvalidCampaignId> {
    campaign_id.parse::<i64>().map_err(|_| InvalidCampaignId {
        raw: campaign_id.to_string(),
        reason: "not a 64-bit integer",
    })
}

/// Upserts rows keyed by `(campaign_id, date)`. A NULL incoming network never
/// erases a stored one.
pub async fn upsert_facts(
    conn: &mut PgConnection,
    source: SourceSystem,
    rows: &[RawFactRow],
) -> StoreResult<u64> {
    let table = source.fact_table();
    let sql = upsert_sql(table);
    let mut affected = 0u64;

    for row in rows {
        let campaign_id = normalize_campaign_id(table.id_kind, &row.campaign_id)?;
        let mut query = sqlx::query(&sql);
        query = match table.id_kind {
            CampaignIdKind::BigInt => query.bind(bigint_id(&campaign_id)?),
            CampaignIdKind::Text => query.bind(campaign_id),
        };
        query = query.bind(row.date).bind(&row.campaign_name);
        if table.has_network {
            query = query.bind(&row.network);
        }
        let metrics = &row.metrics;
        affected += query
            .bind(metrics.impressions)
            .bind(metrics.clicks)
            .bind(metrics.cost_micros)
            .bind(metrics.conversions)
            .bind(metrics.revenue_micros)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(affected)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub facts_upserted: u64,
    /// Normalized external campaign id -> mapping id.
    pub mappings: BTreeMap<String, i64>,
}

/// Writes one fetched report atomically: all fact rows plus one
/// `ensure_mapping` per distinct campaign, or nothing at all.
pub async fn commit_report(
    pool: &PgPool,
    source: SourceSystem,
    rows: &[RawFactRow],
) -> StoreResult<CommitOutcome> {
    let mut tx = pool.begin().await?;
    let facts_upserted = upsert_facts(&mut *tx, source, rows).await?;

    let mut mappings = BTreeMap::new();
    for campaign_id in distinct_campaign_ids(rows) {
        let mapping_id = ensure_mapping(&mut *tx, source, &campaign_id).await?;
        mappings.insert(campaign_id, mapping_id);
    }

    tx.commit().await?;
    info!(
        source = %source,
        facts = facts_upserted,
        campaigns = mappings.len(),
        "report committed"
    );
    Ok(CommitOutcome {
        facts_upserted,
        mappings,
    })
}
