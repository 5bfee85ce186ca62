//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS work_items (
            message_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'queued',
            sender TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL DEFAULT '',
            body_excerpt TEXT NOT NULL DEFAULT '',
            generated_text TEXT,
            published_id TEXT,
            error_detail TEXT,
            queued_at TEXT NOT NULL,
            processed_at TEXT,
            posted_at TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);

        CREATE TABLE IF NOT EXISTS checkpoints (
            name TEXT PRIMARY KEY,
            watermark TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#,
}];

/// Apply all migrations newer than the recorded schema version.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| StoreError::Migration(format!("{}: {e}", migration.name)))?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| StoreError::Migration(format!("record {}: {e}", migration.name)))?;

        tracing::info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("read schema version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("parse schema version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(StoreError::Migration(format!("read schema version: {e}"))),
    }
}
