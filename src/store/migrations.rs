//! Version-tracked schema migrations.
//!
//! Each migration has a version number and SQL with `{schema}` placeholders.
//! `run_migrations()` checks the current version and applies only the new
//! ones, each inside its own transaction.

use libsql::Connection;

use crate::error::DatabaseError;
use crate::queue::QueuePolicy;
use crate::store::plans::{self, Schema};

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS {schema}_queue (
                name TEXT PRIMARY KEY,
                policy TEXT NOT NULL DEFAULT 'standard',
                retry_limit INTEGER NOT NULL,
                retry_delay INTEGER NOT NULL,
                retry_backoff INTEGER NOT NULL DEFAULT 0,
                retry_delay_max INTEGER,
                expire_seconds INTEGER NOT NULL,
                retention_seconds INTEGER NOT NULL,
                deletion_seconds INTEGER NOT NULL,
                dead_letter TEXT,
                partitioned INTEGER NOT NULL DEFAULT 0,
                warning_queued INTEGER NOT NULL DEFAULT 0,
                deferred_count INTEGER NOT NULL DEFAULT 0,
                queued_count INTEGER NOT NULL DEFAULT 0,
                active_count INTEGER NOT NULL DEFAULT 0,
                total_count INTEGER NOT NULL DEFAULT 0,
                monitor_on INTEGER,
                maintain_on INTEGER,
                created_on INTEGER NOT NULL,
                updated_on INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}_job (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                data TEXT,
                state INTEGER NOT NULL DEFAULT 0,
                retry_limit INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_delay INTEGER NOT NULL,
                retry_backoff INTEGER NOT NULL DEFAULT 0,
                retry_delay_max INTEGER,
                expire_seconds INTEGER NOT NULL,
                singleton_key TEXT,
                singleton_on INTEGER,
                group_id TEXT,
                group_tier TEXT,
                start_after INTEGER NOT NULL,
                created_on INTEGER NOT NULL,
                started_on INTEGER,
                completed_on INTEGER,
                keep_until INTEGER NOT NULL,
                output TEXT,
                dead_letter TEXT,
                policy TEXT NOT NULL DEFAULT 'standard'
            );
            CREATE INDEX IF NOT EXISTS {schema}_job_fetch
                ON {schema}_job (name, state, start_after);
            CREATE INDEX IF NOT EXISTS {schema}_job_group
                ON {schema}_job (name, group_id) WHERE state = 2 AND group_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS {schema}_job_settled
                ON {schema}_job (name, completed_on) WHERE state > 2;

            CREATE UNIQUE INDEX IF NOT EXISTS {schema}_job_throttle
                ON {schema}_job (name, singleton_on, COALESCE(singleton_key, ''))
                WHERE state <> 4 AND singleton_on IS NOT NULL;

            CREATE TABLE IF NOT EXISTS {schema}_schedule (
                name TEXT NOT NULL,
                key TEXT NOT NULL DEFAULT '',
                cron TEXT NOT NULL,
                timezone TEXT,
                data TEXT,
                options TEXT,
                created_on INTEGER NOT NULL,
                updated_on INTEGER NOT NULL,
                PRIMARY KEY (name, key)
            );

            CREATE TABLE IF NOT EXISTS {schema}_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cron_on INTEGER
            );
            INSERT OR IGNORE INTO {schema}_meta (id, cron_on) VALUES (1, NULL);
        "#,
    },
];

/// Policy-scoped unique indexes. Built from `plans::policy_index_shape` so
/// partitioned queues get exactly the same invariant.
fn policy_indexes(schema: &Schema) -> String {
    QueuePolicy::ALL
        .into_iter()
        .filter_map(|policy| {
            let (columns, predicate) = plans::policy_index_shape(policy)?;
            Some(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {prefix}_job_policy_{policy}
                    ON {job} ({columns})
                    WHERE policy = '{policy}' AND {predicate};",
                prefix = schema.as_str(),
                job = schema.job_table(),
                policy = policy.as_str(),
            ))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection, schema: &Schema) -> Result<(), DatabaseError> {
    let table = schema.migrations_table();
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )"
        ),
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create {table}: {e}")))?;

    let current_version = get_current_version(conn, &table).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                schema = schema.as_str(),
                "Applying migration"
            );
            let mut sql = schema.render(migration.sql);
            if migration.version == 1 {
                sql.push_str(&policy_indexes(schema));
            }
            apply(conn, &table, migration, &sql).await?;
        }
    }

    tracing::info!(
        schema = schema.as_str(),
        "Database migrations complete (at V{})",
        MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
    );
    Ok(())
}

async fn apply(
    conn: &Connection,
    table: &str,
    migration: &Migration,
    sql: &str,
) -> Result<(), DatabaseError> {
    let batch = format!(
        "BEGIN IMMEDIATE;\n{sql}\nINSERT OR IGNORE INTO {table} (version, name) VALUES ({version}, '{name}');\nCOMMIT;",
        version = migration.version,
        name = migration.name,
    );
    if let Err(e) = conn.execute_batch(&batch).await {
        let _ = conn.execute("ROLLBACK", ()).await;
        return Err(DatabaseError::Migration(format!(
            "Migration V{} ({}) failed: {e}",
            migration.version, migration.name
        )));
    }
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection, table: &str) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query(&format!("SELECT COALESCE(MAX(version), 0) FROM {table}"), ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}
