//! Key/value health signals with trigger-maintained `updated_at`.

use adsync_core::StatusEntry;
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::{StoreError, StoreResult};

type StatusRow = (String, String, DateTime<Utc>);

fn into_entry((status_key, status_value, updated_at): StatusRow) -> StatusEntry {
    StatusEntry {
        status_key,
        status_value,
        updated_at,
    }
}

/// Upserts a status value. `updated_at` is refreshed by the
/// `system_status_refresh_updated_at` trigger inside the same statement.
pub async fn set_status<'e, E>(executor: E, key: &str, value: &str) -> StoreResult<StatusEntry>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, StatusRow>(
        r#"
        INSERT INTO system_status (status_key, status_value)
        VALUES ($1, $2)
        ON CONFLICT (status_key) DO UPDATE SET status_value = EXCLUDED.status_value
        RETURNING status_key, status_value, updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .fetch_one(executor)
    .await?;
    Ok(into_entry(row))
}

pub async fn get_status<'e, E>(executor: E, key: &str) -> StoreResult<StatusEntry>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, StatusRow>(
        "SELECT status_key, status_value, updated_at FROM system_status WHERE status_key = $1",
    )
    .bind(key)
    .fetch_optional(executor)
    .await?
    .map(into_entry)
    .ok_or_else(|| StoreError::NotFound {
        entity: "status",
        key: key.to_string(),
    })
}

pub async fn list_statuses<'e, E>(executor: E) -> StoreResult<Vec<StatusEntry>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, StatusRow>(
        "SELECT status_key, status_value, updated_at FROM system_status ORDER BY status_key",
    )
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(into_entry).collect())
}
