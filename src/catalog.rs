//! Append-only versioning of a connection's sync catalog.
//!
//! Every applied repair and every onboarding produces a new immutable
//! version row. Version numbers for a connection start at 1 and increase
//! by exactly 1; failed repair attempts never consume a number because
//! the insert happens only after the external apply succeeded.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::SyncCatalogVersion;

/// Append `catalog` as the next version for the connection and return the
/// assigned version number.
///
/// The max-read and the insert run in one transaction. Callers that pair
/// this with a status transition must hold the registry's per-connection
/// lock so the pair is observed atomically.
pub async fn append(pool: &SqlitePool, connection_id: &str, catalog: &Value) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let current_max: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version_number) FROM catalog_versions WHERE connection_id = ?")
            .bind(connection_id)
            .fetch_one(&mut *tx)
            .await?;
    let version_number = current_max.unwrap_or(0) + 1;

    sqlx::query(
        r#"
        INSERT INTO catalog_versions (id, connection_id, catalog_json, version_number, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(connection_id)
    .bind(serde_json::to_string(catalog)?)
    .bind(version_number)
    .bind(Utc::now().timestamp())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(version_number)
}

/// The highest-numbered catalog version for a connection, if any.
pub async fn latest(pool: &SqlitePool, connection_id: &str) -> Result<Option<SyncCatalogVersion>> {
    let row = sqlx::query(
        "SELECT * FROM catalog_versions WHERE connection_id = ? ORDER BY version_number DESC LIMIT 1",
    )
    .bind(connection_id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| version_from_row(&r)).transpose()
}

/// All versions for a connection, oldest first.
pub async fn list(pool: &SqlitePool, connection_id: &str) -> Result<Vec<SyncCatalogVersion>> {
    let rows = sqlx::query(
        "SELECT * FROM catalog_versions WHERE connection_id = ? ORDER BY version_number",
    )
    .bind(connection_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(version_from_row).collect()
}

fn version_from_row(row: &SqliteRow) -> Result<SyncCatalogVersion> {
    let catalog_json: String = row.try_get("catalog_json")?;
    Ok(SyncCatalogVersion {
        id: row.try_get("id")?,
        connection_id: row.try_get("connection_id")?,
        catalog: serde_json::from_str(&catalog_json)?,
        version_number: row.try_get("version_number")?,
        created_at: row.try_get("created_at")?,
    })
}
