use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables if they do not exist. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Connections table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            source_type TEXT NOT NULL,
            external_source_id TEXT,
            external_connection_id TEXT,
            status TEXT NOT NULL,
            last_health_check INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Catalog versions table (append-only)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_versions (
            id TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL,
            catalog_json TEXT NOT NULL,
            version_number INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(connection_id, version_number),
            FOREIGN KEY (connection_id) REFERENCES connections(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Job history table; one row per external job id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_history (
            id TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL,
            external_job_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (connection_id) REFERENCES connections(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Repair knowledge table (append-only feedback store)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repair_knowledge (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            error_signature TEXT NOT NULL,
            signature_fingerprint TEXT NOT NULL,
            signature_embedding BLOB,
            catalog_json TEXT NOT NULL,
            confidence REAL NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_status ON connections(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_catalog_versions_connection ON catalog_versions(connection_id, version_number DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_history_connection ON job_history(connection_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_repair_knowledge_source_type ON repair_knowledge(source_type, created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
