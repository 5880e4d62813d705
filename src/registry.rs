//! Connection registry — the single source of truth for lifecycle state.
//!
//! Every status transition in the system is a read-modify-write against
//! this registry. The registry also hands out a per-connection async lock
//! so that the repair agent and the operator apply path cannot interleave
//! a status transition with a catalog append on the same connection.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::{Connection, ConnectionStatus};

pub struct ConnectionRegistry {
    pool: SqlitePool,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The write lock for one connection id. Hold this across a status
    /// transition plus catalog append so concurrent repair attempts on the
    /// same connection are serialized.
    pub fn connection_lock(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(connection_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Create a connection in PENDING. Downstream identifiers stay unset
    /// until the onboarding flow provisions them.
    pub async fn register(&self, name: &str, source_type: &str) -> Result<Connection> {
        let now = Utc::now().timestamp();
        let connection = Connection {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            source_type: source_type.to_string(),
            external_source_id: None,
            external_connection_id: None,
            status: ConnectionStatus::Pending,
            last_health_check: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO connections (id, name, source_type, external_source_id, external_connection_id, status, last_health_check, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.name)
        .bind(&connection.source_type)
        .bind(&connection.external_source_id)
        .bind(&connection.external_connection_id)
        .bind(connection.status.as_str())
        .bind(connection.last_health_check)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(connection)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Connection>> {
        let row = sqlx::query("SELECT * FROM connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| connection_from_row(&r)).transpose()
    }

    /// Transition a connection's status. Returns None if the id is unknown;
    /// the caller decides whether that is fatal.
    pub async fn update_status(
        &self,
        id: &str,
        status: ConnectionStatus,
    ) -> Result<Option<Connection>> {
        let now = Utc::now().timestamp();
        let affected = sqlx::query("UPDATE connections SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Like [`update_status`](Self::update_status), but also stamps
    /// `last_health_check`.
    pub async fn update_health(
        &self,
        id: &str,
        status: ConnectionStatus,
    ) -> Result<Option<Connection>> {
        let now = Utc::now().timestamp();
        let affected = sqlx::query(
            "UPDATE connections SET status = ?, last_health_check = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Stamp `last_health_check` without touching status.
    pub async fn touch_health(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("UPDATE connections SET last_health_check = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a connection together with all its catalog versions and job
    /// history, in one transaction. Returns false if the id is unknown.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM catalog_versions WHERE connection_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_history WHERE connection_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let affected = sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        self.locks.lock().unwrap().remove(id);
        Ok(affected > 0)
    }

    pub async fn list_by_status(&self, statuses: &[ConnectionStatus]) -> Result<Vec<Connection>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM connections WHERE status IN ({}) ORDER BY created_at",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(connection_from_row).collect()
    }

    pub async fn list_by_type(&self, source_type: &str) -> Result<Vec<Connection>> {
        let rows = sqlx::query("SELECT * FROM connections WHERE source_type = ? ORDER BY created_at")
            .bind(source_type)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(connection_from_row).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<Connection>> {
        let rows = sqlx::query("SELECT * FROM connections ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(connection_from_row).collect()
    }

    /// Job history rows for one connection, newest first.
    pub async fn job_history(&self, connection_id: &str) -> Result<Vec<crate::models::JobRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM job_history WHERE connection_id = ? ORDER BY created_at DESC",
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(crate::models::JobRecord {
                    id: row.try_get("id")?,
                    connection_id: row.try_get("connection_id")?,
                    external_job_id: row.try_get("external_job_id")?,
                    status: row.try_get("status")?,
                    error_message: row.try_get("error_message")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Record the downstream identifiers assigned during onboarding.
    pub async fn set_external_ids(
        &self,
        id: &str,
        external_source_id: &str,
        external_connection_id: &str,
    ) -> Result<Option<Connection>> {
        let now = Utc::now().timestamp();
        let affected = sqlx::query(
            "UPDATE connections SET external_source_id = ?, external_connection_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(external_source_id)
        .bind(external_connection_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(None);
        }
        self.get(id).await
    }
}

fn connection_from_row(row: &SqliteRow) -> Result<Connection> {
    let status_text: String = row.try_get("status")?;
    let status = ConnectionStatus::parse(&status_text)
        .ok_or_else(|| anyhow::anyhow!("Unknown connection status in database: {}", status_text))?;

    Ok(Connection {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source_type: row.try_get("source_type")?,
        external_source_id: row.try_get("external_source_id")?,
        external_connection_id: row.try_get("external_connection_id")?,
        status,
        last_health_check: row.try_get("last_health_check")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn test_registry() -> (tempfile::TempDir, ConnectionRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("sentinel.sqlite");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (tmp, ConnectionRegistry::new(pool))
    }

    #[tokio::test]
    async fn test_register_starts_pending() {
        let (_tmp, registry) = test_registry().await;
        let conn = registry.register("orders-db", "postgres").await.unwrap();
        assert_eq!(conn.status, ConnectionStatus::Pending);
        assert!(conn.external_source_id.is_none());

        let fetched = registry.get(&conn.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "orders-db");
    }

    #[tokio::test]
    async fn test_update_status_unknown_id_returns_none() {
        let (_tmp, registry) = test_registry().await;
        let result = registry
            .update_status("no-such-id", ConnectionStatus::Active)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_update_health_stamps_timestamp() {
        let (_tmp, registry) = test_registry().await;
        let conn = registry.register("orders-db", "postgres").await.unwrap();
        assert!(conn.last_health_check.is_none());

        let updated = registry
            .update_health(&conn.id, ConnectionStatus::Active)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, ConnectionStatus::Active);
        assert!(updated.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let (_tmp, registry) = test_registry().await;
        let a = registry.register("a", "postgres").await.unwrap();
        let b = registry.register("b", "mysql").await.unwrap();
        registry
            .update_status(&a.id, ConnectionStatus::Active)
            .await
            .unwrap();
        registry
            .update_status(&b.id, ConnectionStatus::Drifted)
            .await
            .unwrap();

        let watched = registry
            .list_by_status(&[ConnectionStatus::Active, ConnectionStatus::Drifted])
            .await
            .unwrap();
        assert_eq!(watched.len(), 2);

        let pending = registry
            .list_by_status(&[ConnectionStatus::Pending])
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cascades_only_own_rows() {
        let (_tmp, registry) = test_registry().await;
        let doomed = registry.register("doomed", "postgres").await.unwrap();
        let survivor = registry.register("survivor", "postgres").await.unwrap();

        for conn_id in [&doomed.id, &survivor.id] {
            sqlx::query(
                "INSERT INTO catalog_versions (id, connection_id, catalog_json, version_number, created_at) VALUES (?, ?, '{}', 1, 0)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(conn_id)
            .execute(registry.pool())
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO job_history (id, connection_id, external_job_id, status, error_message, created_at) VALUES (?, ?, ?, 'FAILED', NULL, 0)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(conn_id)
            .bind(Uuid::new_v4().to_string())
            .execute(registry.pool())
            .await
            .unwrap();
        }

        assert!(registry.delete(&doomed.id).await.unwrap());
        assert!(registry.get(&doomed.id).await.unwrap().is_none());

        let versions: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM catalog_versions WHERE connection_id = ?")
                .bind(&doomed.id)
                .fetch_one(registry.pool())
                .await
                .unwrap();
        let jobs: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_history WHERE connection_id = ?")
                .bind(&doomed.id)
                .fetch_one(registry.pool())
                .await
                .unwrap();
        assert_eq!(versions, 0);
        assert_eq!(jobs, 0);

        // The other connection's rows are untouched.
        let survivor_versions: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM catalog_versions WHERE connection_id = ?")
                .bind(&survivor.id)
                .fetch_one(registry.pool())
                .await
                .unwrap();
        assert_eq!(survivor_versions, 1);
    }

    #[tokio::test]
    async fn test_delete_unknown_id_returns_false() {
        let (_tmp, registry) = test_registry().await;
        assert!(!registry.delete("no-such-id").await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_lock_is_shared_per_id() {
        let (_tmp, registry) = test_registry().await;
        let lock_a = registry.connection_lock("conn-1");
        let lock_b = registry.connection_lock("conn-1");
        assert!(Arc::ptr_eq(&lock_a, &lock_b));

        let other = registry.connection_lock("conn-2");
        assert!(!Arc::ptr_eq(&lock_a, &other));
    }
}
