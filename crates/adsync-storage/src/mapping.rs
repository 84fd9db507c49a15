//! Campaign identity mapping store.

use adsync_core::{normalize_campaign_id, CampaignMapping, DisplayUpdate, SourceSystem};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use tracing::{debug, info};

use crate::{StoreError, StoreResult};

const MAPPING_COLUMNS: &str = "id, source_system, external_campaign_id, network, pretty_name, \
     pretty_network, pretty_source, display_order, superseded_by, created_at";

#[derive(Debug, sqlx::FromRow)]
struct MappingRecord {
    id: i64,
    source_system: String,
    external_campaign_id: String,
    network: Option<String>,
    pretty_name: Option<String>,
    pretty_network: Option<String>,
    pretty_source: Option<String>,
    display_order: i32,
    superseded_by: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MappingRecord> for CampaignMapping {
    type Error = StoreError;

    fn try_from(record: MappingRecord) -> Result<Self, Self::Error> {
        let source_system = record
            .source_system
            .parse::<SourceSystem>()
            .map_err(|e| StoreError::Corrupt {
                table: "campaign_mapping",
                detail: format!("row {}: {e}", record.id),
            })?;
        Ok(CampaignMapping {
            id: record.id,
            source_system,
            external_campaign_id: record.external_campaign_id,
            network: record.network,
            pretty_name: record.pretty_name,
            pretty_network: record.pretty_network,
            pretty_source: record.pretty_source,
            display_order: record.display_order,
            superseded_by: record.superseded_by,
            created_at: record.created_at,
        })
    }
}

fn not_found(mapping_id: i64) -> StoreError {
    StoreError::NotFound {
        entity: "campaign mapping",
        key: mapping_id.to_string(),
    }
}

/// Returns the id of the active mapping for the pair, creating it if needed.
///
/// A single `INSERT .. ON CONFLICT .. DO UPDATE .. RETURNING` against the
/// partial unique index over active rows, so racing writers always converge
/// on one row and both observe its id.
pub async fn ensure_mapping<'e, E>(
    executor: E,
    source: SourceSystem,
    external_campaign_id: &str,
) -> StoreResult<i64>
where
    E: PgExecutor<'e>,
{
    let external_id = normalize_campaign_id(source.fact_table().id_kind, external_campaign_id)?;
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO campaign_mapping (source_system, external_campaign_id)
        VALUES ($1, $2)
        ON CONFLICT (source_system, external_campaign_id) WHERE superseded_by IS NULL
        DO UPDATE SET source_system = EXCLUDED.source_system
        RETURNING id
        "#,
    )
    .bind(source.as_str())
    .bind(&external_id)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

/// Fills `network` on mapping rows where it is still NULL, from the most
/// recent non-null network observed in the source's fact table.
pub async fn backfill_network<'e, E>(executor: E, source: SourceSystem) -> StoreResult<u64>
where
    E: PgExecutor<'e>,
{
    let table = source.fact_table();
    if !table.has_network {
        debug!(source = %source, "no network dimension; backfill skipped");
        return Ok(0);
    }

    let sql = format!(
        r#"
        UPDATE campaign_mapping m
           SET network = latest.network
          FROM (
                SELECT DISTINCT ON (campaign_id::text)
                       campaign_id::text AS external_campaign_id,
                       network
                  FROM {fact}
                 WHERE network IS NOT NULL
                 ORDER BY campaign_id::text, date DESC
               ) latest
         WHERE m.source_system = $1
           AND m.network IS NULL
           AND m.external_campaign_id = latest.external_campaign_id
        "#,
        fact = table.name,
    );
    let updated = sqlx::query(&sql)
        .bind(source.as_str())
        .execute(executor)
        .await?
        .rows_affected();
    info!(source = %source, updated, "network backfill complete");
    Ok(updated)
}

/// Partial update of dashboard-owned attributes.
pub async fn set_display<'e, E>(
    executor: E,
    mapping_id: i64,
    update: &DisplayUpdate,
) -> StoreResult<CampaignMapping>
where
    E: PgExecutor<'e>,
{
    let pretty_name = DisplayUpdate::text_change(&update.pretty_name);
    let pretty_network = DisplayUpdate::text_change(&update.pretty_network);
    let pretty_source = DisplayUpdate::text_change(&update.pretty_source);

    let sql = format!(
        r#"
        UPDATE campaign_mapping
           SET pretty_name = CASE WHEN $2 THEN $3 ELSE pretty_name END,
               pretty_network = CASE WHEN $4 THEN $5 ELSE pretty_network END,
               pretty_source = CASE WHEN $6 THEN $7 ELSE pretty_source END,
               display_order = COALESCE($8, display_order)
         WHERE id = $1
        RETURNING {MAPPING_COLUMNS}
        "#
    );
    let record = sqlx::query_as::<_, MappingRecord>(&sql)
        .bind(mapping_id)
        .bind(pretty_name.is_some())
        .bind(pretty_name.flatten())
        .bind(pretty_network.is_some())
        .bind(pretty_network.flatten())
        .bind(pretty_source.is_some())
        .bind(pretty_source.flatten())
        .bind(update.display_order)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| not_found(mapping_id))?;
    CampaignMapping::try_from(record)
}

/// Explicitly unsets `network` so the next backfill pass may fill it again.
pub async fn clear_network<'e, E>(executor: E, mapping_id: i64) -> StoreResult<CampaignMapping>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "UPDATE campaign_mapping SET network = NULL WHERE id = $1 RETURNING {MAPPING_COLUMNS}"
    );
    let record = sqlx::query_as::<_, MappingRecord>(&sql)
        .bind(mapping_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| not_found(mapping_id))?;
    CampaignMapping::try_from(record)
}

pub async fn get_mapping<'e, E>(executor: E, mapping_id: i64) -> StoreResult<CampaignMapping>
where
    E: PgExecutor<'e>,
{
    let sql = format!("SELECT {MAPPING_COLUMNS} FROM campaign_mapping WHERE id = $1");
    let record = sqlx::query_as::<_, MappingRecord>(&sql)
        .bind(mapping_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| not_found(mapping_id))?;
    CampaignMapping::try_from(record)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MappingFilter {
    pub source: Option<SourceSystem>,
    pub include_superseded: bool,
}

/// Mappings in dashboard order.
pub async fn list_mappings<'e, E>(
    executor: E,
    filter: &MappingFilter,
) -> StoreResult<Vec<CampaignMapping>>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        r#"
        SELECT {MAPPING_COLUMNS}
          FROM campaign_mapping
         WHERE ($1::text IS NULL OR source_system = $1)
           AND ($2 OR superseded_by IS NULL)
         ORDER BY display_order, COALESCE(pretty_name, external_campaign_id), id
        "#
    );
    let records = sqlx::query_as::<_, MappingRecord>(&sql)
        .bind(filter.source.map(SourceSystem::as_str))
        .bind(filter.include_superseded)
        .fetch_all(executor)
        .await?;
    records.into_iter().map(CampaignMapping::try_from).collect()
}

/// Manual correction: retires the active row for a pair and replaces it with
/// a new active row carrying the corrected display attributes. The retired
/// row stays in place (`superseded_by` points at its replacement) so history
/// keeps resolving.
pub async fn supersede_mapping(
    pool: &PgPool,
    mapping_id: i64,
    update: &DisplayUpdate,
) -> StoreResult<CampaignMapping> {
    let mut tx = pool.begin().await?;

    let select = format!(
        "SELECT {MAPPING_COLUMNS} FROM campaign_mapping WHERE id = $1 AND superseded_by IS NULL FOR UPDATE"
    );
    let current = sqlx::query_as::<_, MappingRecord>(&select)
        .bind(mapping_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| not_found(mapping_id))?;
    let current = CampaignMapping::try_from(current)?;

    let replacement_id = sqlx::query_scalar::<_, i64>(
        "SELECT nextval(pg_get_serial_sequence('campaign_mapping', 'id'))",
    )
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE campaign_mapping SET superseded_by = $2 WHERE id = $1")
        .bind(mapping_id)
        .bind(replacement_id)
        .execute(&mut *tx)
        .await?;

    let mut replacement = current.clone();
    replacement.id = replacement_id;
    update.apply_to(&mut replacement);

    let insert = format!(
        r#"
        INSERT INTO campaign_mapping (
            id, source_system, external_campaign_id, network,
            pretty_name, pretty_network, pretty_source, display_order
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {MAPPING_COLUMNS}
        "#
    );
    let record = sqlx::query_as::<_, MappingRecord>(&insert)
        .bind(replacement.id)
        .bind(replacement.source_system.as_str())
        .bind(&replacement.external_campaign_id)
        .bind(&replacement.network)
        .bind(&replacement.pretty_name)
        .bind(&replacement.pretty_network)
        .bind(&replacement.pretty_source)
        .bind(replacement.display_order)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    info!(
        superseded = mapping_id,
        replacement = replacement_id,
        source = %current.source_system,
        external_campaign_id = %current.external_campaign_id,
        "mapping superseded"
    );
    CampaignMapping::try_from(record)
}
