//! Forward-only, existence-checked schema evolution.
//!
//! Every operation checks the catalog of `current_schema()` before touching
//! it, and the whole sequence can be replayed against any earlier database
//! state. Conflicts that slip past a check (another migrator won the race on
//! a server without the advisory lock, a hand-applied hotfix) are absorbed
//! inside a savepoint.

use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, info};

use crate::{StoreError, StoreResult};

/// Serializes migrators across processes for the life of the migration transaction.
const MIGRATION_LOCK_KEY: i64 = 0x6164_7379_6e63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOp {
    CreateTable {
        table: &'static str,
        ddl: &'static str,
    },
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
    DropConstraint {
        table: &'static str,
        constraint: &'static str,
    },
    CreateIndex {
        index: &'static str,
        ddl: &'static str,
    },
    CreateFunction {
        function: &'static str,
        ddl: &'static str,
    },
    CreateTrigger {
        table: &'static str,
        trigger: &'static str,
        ddl: &'static str,
    },
}

impl SchemaOp {
    pub fn describe(&self) -> String {
        match self {
            SchemaOp::CreateTable { table, .. } => format!("create table {table}"),
            SchemaOp::AddColumn { table, column, .. } => format!("add column {table}.{column}"),
            SchemaOp::DropConstraint { table, constraint } => {
                format!("drop constraint {table}.{constraint}")
            }
            SchemaOp::CreateIndex { index, .. } => format!("create index {index}"),
            SchemaOp::CreateFunction { function, .. } => format!("create function {function}"),
            SchemaOp::CreateTrigger { table, trigger, .. } => {
                format!("create trigger {table}.{trigger}")
            }
        }
    }

    pub fn statement(&self) -> String {
        match self {
            SchemaOp::CreateTable { ddl, .. }
            | SchemaOp::CreateIndex { ddl, .. }
            | SchemaOp::CreateFunction { ddl, .. }
            | SchemaOp::CreateTrigger { ddl, .. } => (*ddl).to_string(),
            SchemaOp::AddColumn {
                table,
                column,
                definition,
            } => format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
            SchemaOp::DropConstraint { table, constraint } => {
                format!("ALTER TABLE {table} DROP CONSTRAINT {constraint}")
            }
        }
    }

    /// True when the catalog already reflects this operation's target state.
    pub async fn is_satisfied(&self, conn: &mut PgConnection) -> Result<bool, sqlx::Error> {
        match self {
            SchemaOp::CreateTable { table, .. } => {
                sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                          FROM information_schema.tables
                         WHERE table_schema = current_schema()
                           AND table_name = $1
                    )
                    "#,
                )
                .bind(table)
                .fetch_one(&mut *conn)
                .await
            }
            SchemaOp::AddColumn { table, column, .. } => {
                sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                          FROM information_schema.columns
                         WHERE table_schema = current_schema()
                           AND table_name = $1
                           AND column_name = $2
                    )
                    "#,
                )
                .bind(table)
                .bind(column)
                .fetch_one(&mut *conn)
                .await
            }
            SchemaOp::DropConstraint { table, constraint } => {
                let present = sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                          FROM pg_constraint
                         WHERE conrelid = to_regclass($1)
                           AND conname = $2
                    )
                    "#,
                )
                .bind(table)
                .bind(constraint)
                .fetch_one(&mut *conn)
                .await?;
                Ok(!present)
            }
            SchemaOp::CreateIndex { index, .. } => {
                sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                          FROM pg_indexes
                         WHERE schemaname = current_schema()
                           AND indexname = $1
                    )
                    "#,
                )
                .bind(index)
                .fetch_one(&mut *conn)
                .await
            }
            SchemaOp::CreateFunction { function, .. } => {
                sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                          FROM pg_proc p
                          JOIN pg_namespace n ON n.oid = p.pronamespace
                         WHERE n.nspname = current_schema()
                           AND p.proname = $1
                    )
                    "#,
                )
                .bind(function)
                .fetch_one(&mut *conn)
                .await
            }
            SchemaOp::CreateTrigger { table, trigger, .. } => {
                sqlx::query_scalar::<_, bool>(
                    r#"
                    SELECT EXISTS (
                        SELECT 1
                          FROM pg_trigger
                         WHERE tgrelid = to_regclass($1)
                           AND tgname = $2
                           AND NOT tgisinternal
                    )
                    "#,
                )
                .bind(table)
                .bind(trigger)
                .fetch_one(&mut *conn)
                .await
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub version: i32,
    pub name: &'static str,
    pub ops: &'static [SchemaOp],
}

const FACT_TABLE_GOOGLE_ADS: &str = r#"
CREATE TABLE google_ads_fact (
    campaign_id BIGINT NOT NULL,
    date DATE NOT NULL,
    campaign_name TEXT,
    network TEXT,
    impressions BIGINT NOT NULL DEFAULT 0,
    clicks BIGINT NOT NULL DEFAULT 0,
    cost_micros BIGINT NOT NULL DEFAULT 0,
    conversions DOUBLE PRECISION NOT NULL DEFAULT 0,
    revenue_micros BIGINT NOT NULL DEFAULT 0,
    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (campaign_id, date)
)
"#;

const FACT_TABLE_BING_ADS: &str = r#"
CREATE TABLE bing_ads_fact (
    campaign_id BIGINT NOT NULL,
    date DATE NOT NULL,
    campaign_name TEXT,
    network TEXT,
    impressions BIGINT NOT NULL DEFAULT 0,
    clicks BIGINT NOT NULL DEFAULT 0,
    cost_micros BIGINT NOT NULL DEFAULT 0,
    conversions DOUBLE PRECISION NOT NULL DEFAULT 0,
    revenue_micros BIGINT NOT NULL DEFAULT 0,
    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (campaign_id, date)
)
"#;

const FACT_TABLE_REDTRACK: &str = r#"
CREATE TABLE redtrack_fact (
    campaign_id TEXT NOT NULL,
    date DATE NOT NULL,
    campaign_name TEXT,
    impressions BIGINT NOT NULL DEFAULT 0,
    clicks BIGINT NOT NULL DEFAULT 0,
    cost_micros BIGINT NOT NULL DEFAULT 0,
    conversions DOUBLE PRECISION NOT NULL DEFAULT 0,
    revenue_micros BIGINT NOT NULL DEFAULT 0,
    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (campaign_id, date)
)
"#;

const FACT_TABLE_MATOMO: &str = r#"
CREATE TABLE matomo_fact (
    campaign_id TEXT NOT NULL,
    date DATE NOT NULL,
    campaign_name TEXT,
    impressions BIGINT NOT NULL DEFAULT 0,
    clicks BIGINT NOT NULL DEFAULT 0,
    cost_micros BIGINT NOT NULL DEFAULT 0,
    conversions DOUBLE PRECISION NOT NULL DEFAULT 0,
    revenue_micros BIGINT NOT NULL DEFAULT 0,
    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (campaign_id, date)
)
"#;

/// Ordered migration history. Append only; never edit an applied step.
pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        name: "create_campaign_mapping",
        ops: &[SchemaOp::CreateTable {
            table: "campaign_mapping",
            ddl: r#"
            CREATE TABLE campaign_mapping (
                id BIGSERIAL PRIMARY KEY,
                source_system TEXT NOT NULL,
                external_campaign_id TEXT NOT NULL,
                pretty_name TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                CONSTRAINT campaign_mapping_business_key UNIQUE (source_system, external_campaign_id)
            )
            "#,
        }],
    },
    MigrationStep {
        version: 2,
        name: "mapping_network",
        ops: &[SchemaOp::AddColumn {
            table: "campaign_mapping",
            column: "network",
            definition: "TEXT",
        }],
    },
    MigrationStep {
        version: 3,
        name: "mapping_display_overrides",
        ops: &[
            SchemaOp::AddColumn {
                table: "campaign_mapping",
                column: "pretty_network",
                definition: "TEXT",
            },
            SchemaOp::AddColumn {
                table: "campaign_mapping",
                column: "pretty_source",
                definition: "TEXT",
            },
        ],
    },
    MigrationStep {
        version: 4,
        name: "mapping_display_order",
        ops: &[SchemaOp::AddColumn {
            table: "campaign_mapping",
            column: "display_order",
            definition: "INTEGER NOT NULL DEFAULT 0",
        }],
    },
    MigrationStep {
        version: 5,
        name: "drop_mapping_business_key",
        ops: &[SchemaOp::DropConstraint {
            table: "campaign_mapping",
            constraint: "campaign_mapping_business_key",
        }],
    },
    MigrationStep {
        version: 6,
        name: "mapping_correction_history",
        ops: &[
            SchemaOp::AddColumn {
                table: "campaign_mapping",
                column: "superseded_by",
                definition: "BIGINT",
            },
            SchemaOp::CreateIndex {
                index: "campaign_mapping_active_pair",
                ddl: r#"
                CREATE UNIQUE INDEX campaign_mapping_active_pair
                    ON campaign_mapping (source_system, external_campaign_id)
                 WHERE superseded_by IS NULL
                "#,
            },
        ],
    },
    MigrationStep {
        version: 7,
        name: "system_status",
        ops: &[
            SchemaOp::CreateTable {
                table: "system_status",
                ddl: r#"
                CREATE TABLE system_status (
                    status_key TEXT PRIMARY KEY,
                    status_value TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
                )
                "#,
            },
            SchemaOp::CreateFunction {
                function: "refresh_updated_at",
                ddl: r#"
                CREATE OR REPLACE FUNCTION refresh_updated_at() RETURNS trigger AS $$
                BEGIN
                    NEW.updated_at = clock_timestamp();
                    RETURN NEW;
                END;
                $$ LANGUAGE plpgsql
                "#,
            },
            SchemaOp::CreateTrigger {
                table: "system_status",
                trigger: "system_status_refresh_updated_at",
                ddl: r#"
                CREATE TRIGGER system_status_refresh_updated_at
                    BEFORE UPDATE ON system_status
                    FOR EACH ROW EXECUTE FUNCTION refresh_updated_at()
                "#,
            },
        ],
    },
    MigrationStep {
        version: 8,
        name: "raw_fact_tables",
        ops: &[
            SchemaOp::CreateTable {
                table: "google_ads_fact",
                ddl: FACT_TABLE_GOOGLE_ADS,
            },
            SchemaOp::CreateTable {
                table: "bing_ads_fact",
                ddl: FACT_TABLE_BING_ADS,
            },
            SchemaOp::CreateTable {
                table: "redtrack_fact",
                ddl: FACT_TABLE_REDTRACK,
            },
            SchemaOp::CreateTable {
                table: "matomo_fact",
                ddl: FACT_TABLE_MATOMO,
            },
        ],
    },
];

/// SQLSTATEs meaning "this object is already in the requested state".
pub fn is_schema_conflict_code(code: &str) -> bool {
    matches!(
        code,
        // duplicate_column, duplicate_table, duplicate_object, duplicate_function, undefined_object
        "42701" | "42P07" | "42710" | "42723" | "42704"
    )
}

fn schema_conflict(step: &MigrationStep, op: &SchemaOp, err: &sqlx::Error) -> Option<StoreError> {
    let db_err = err.as_database_error()?;
    let code = db_err.code()?;
    if !is_schema_conflict_code(&code) {
        return None;
    }
    Some(StoreError::SchemaConflict {
        step: format!("v{} {} ({})", step.version, step.name, op.describe()),
        detail: db_err.message().to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied_ops: usize,
    pub skipped_ops: usize,
    pub absorbed_conflicts: usize,
    pub newly_recorded: Vec<i32>,
}

pub async fn apply_migrations(pool: &PgPool) -> StoreResult<MigrationReport> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let mut report = MigrationReport::default();
    for step in MIGRATIONS {
        for op in step.ops {
            if op.is_satisfied(&mut *tx).await? {
                debug!(version = step.version, op = %op.describe(), "schema op already satisfied");
                report.skipped_ops += 1;
                continue;
            }

            let mut savepoint = tx.begin().await?;
            match sqlx::query(&op.statement()).execute(&mut *savepoint).await {
                Ok(_) => {
                    savepoint.commit().await?;
                    report.applied_ops += 1;
                }
                Err(err) => match schema_conflict(step, op, &err) {
                    Some(conflict) => {
                        savepoint.rollback().await?;
                        info!(%conflict, "absorbed schema conflict");
                        report.absorbed_conflicts += 1;
                    }
                    None => return Err(err.into()),
                },
            }
        }

        let recorded = sqlx::query(
            "INSERT INTO schema_migrations (version, name) VALUES ($1, $2) ON CONFLICT (version) DO NOTHING",
        )
        .bind(step.version)
        .bind(step.name)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if recorded == 1 {
            info!(version = step.version, name = step.name, "schema migration recorded");
            report.newly_recorded.push(step.version);
        }
    }

    tx.commit().await?;
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ColumnShape {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: String,
    pub column_default: Option<String>,
}

/// Catalog view of everything the migrations manage in `current_schema()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub columns: Vec<ColumnShape>,
    pub indexes: Vec<String>,
    pub constraints: Vec<String>,
    pub triggers: Vec<String>,
    pub recorded_versions: Vec<i32>,
}

pub async fn schema_snapshot(pool: &PgPool) -> StoreResult<SchemaSnapshot> {
    let columns = sqlx::query_as::<_, ColumnShape>(
        r#"
        SELECT table_name::text AS table_name,
               column_name::text AS column_name,
               data_type::text AS data_type,
               is_nullable::text AS is_nullable,
               column_default::text AS column_default
          FROM information_schema.columns
         WHERE table_schema = current_schema()
         ORDER BY table_name, column_name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let indexes = sqlx::query_scalar::<_, String>(
        "SELECT indexname::text FROM pg_indexes WHERE schemaname = current_schema() ORDER BY indexname",
    )
    .fetch_all(pool)
    .await?;

    let constraints = sqlx::query_scalar::<_, String>(
        r#"
        SELECT c.conname::text
          FROM pg_constraint c
          JOIN pg_namespace n ON n.oid = c.connamespace
         WHERE n.nspname = current_schema()
         ORDER BY c.conname
        "#,
    )
    .fetch_all(pool)
    .await?;

    let triggers = sqlx::query_scalar::<_, String>(
        r#"
        SELECT t.tgname::text
          FROM pg_trigger t
          JOIN pg_class c ON c.oid = t.tgrelid
          JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = current_schema()
           AND NOT t.tgisinternal
         ORDER BY t.tgname
        "#,
    )
    .fetch_all(pool)
    .await?;

    let recorded_versions =
        sqlx::query_scalar::<_, i32>("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(pool)
            .await?;

    Ok(SchemaSnapshot {
        columns,
        indexes,
        constraints,
        triggers,
        recorded_versions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_versions_are_strictly_increasing() {
        let versions = MIGRATIONS.iter().map(|s| s.version).collect::<Vec<_>>();
        assert!(versions.windows(2).all(|w| w[0] < w[1]), "{versions:?}");
        assert_eq!(versions.first(), Some(&1));
    }

    fn step_index(pred: impl Fn(&SchemaOp) -> bool) -> usize {
        MIGRATIONS
            .iter()
            .position(|s| s.ops.iter().any(&pred))
            .unwrap()
    }

    #[test]
    fn business_key_is_dropped_before_active_pair_index_exists() {
        let drop = step_index(|op| {
            *op == SchemaOp::DropConstraint {
                table: "campaign_mapping",
                constraint: "campaign_mapping_business_key",
            }
        });
        let index = step_index(
            |op| matches!(op, SchemaOp::CreateIndex { index, .. } if *index == "campaign_mapping_active_pair"),
        );
        assert!(drop < index);
    }

    #[test]
    fn add_column_statement_is_plain_alter() {
        let op = SchemaOp::AddColumn {
            table: "campaign_mapping",
            column: "network",
            definition: "TEXT",
        };
        assert_eq!(op.statement(), "ALTER TABLE campaign_mapping ADD COLUMN network TEXT");
        assert_eq!(op.describe(), "add column campaign_mapping.network");
    }

    #[test]
    fn conflict_codes_cover_replayed_ddl() {
        assert!(is_schema_conflict_code("42701"));
        assert!(is_schema_conflict_code("42P07"));
        assert!(is_schema_conflict_code("42704"));
        assert!(!is_schema_conflict_code("23505"));
        assert!(!is_schema_conflict_code("42601"));
    }

    #[test]
    fn every_fact_table_has_a_create_step() {
        let created = MIGRATIONS
            .iter()
            .flat_map(|s| s.ops.iter())
            .filter_map(|op| match op {
                SchemaOp::CreateTable { table, .. } => Some(*table),
                _ => None,
            })
            .collect::<Vec<_>>();
        for source in adsync_core::SourceSystem::ALL {
            assert!(created.contains(&source.fact_table().name), "{source}");
        }
    }
}
