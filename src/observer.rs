//! Schema observer — polls watched connections for failed sync jobs and
//! turns schema-compatibility failures into drift events.
//!
//! Detection is idempotent: a job id already present in job history is
//! never re-processed, so re-polling the same failure window publishes at
//! most one drift event per job. A connection with no baseline catalog is
//! skipped entirely (there is nothing to repair from), and that skip rolls
//! back the status and job-history writes so no partial state remains.

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::bus::{EventBus, DRIFT_DETECTED, STATUS_UPDATE};
use crate::classify::DriftClassifier;
use crate::config::ObserverConfig;
use crate::models::{truncate_error, Connection, ConnectionStatus, DriftEvent, StatusUpdate};
use crate::registry::ConnectionRegistry;
use crate::sync_engine::{JobSummary, SyncEngine};

pub struct SchemaObserver {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<dyn SyncEngine>,
    bus: Arc<EventBus>,
    classifier: Box<dyn DriftClassifier>,
    poll_interval: Duration,
    jobs_per_connection: usize,
    running: AtomicBool,
}

impl SchemaObserver {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<dyn SyncEngine>,
        bus: Arc<EventBus>,
        classifier: Box<dyn DriftClassifier>,
        config: &ObserverConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            bus,
            classifier,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            jobs_per_connection: config.jobs_per_connection,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Poll until the shutdown signal flips. Cancellation happens between
    /// cycles, never mid-cycle.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            interval_secs = self.poll_interval.as_secs(),
            "schema observer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "poll cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("schema observer stopped");
    }

    /// One polling pass over every watched connection. A failure on one
    /// connection is logged and never aborts the rest of the cycle.
    pub async fn run_cycle(&self) -> Result<()> {
        let connections = self
            .registry
            .list_by_status(&[
                ConnectionStatus::Active,
                ConnectionStatus::Drifted,
                ConnectionStatus::Healing,
            ])
            .await?;

        for connection in &connections {
            if let Err(e) = self.check_connection(connection).await {
                tracing::warn!(
                    connection_id = %connection.id,
                    error = %e,
                    "skipping connection for this cycle"
                );
            }
        }
        Ok(())
    }

    async fn check_connection(&self, connection: &Connection) -> Result<()> {
        let Some(external_id) = connection.external_connection_id.as_deref() else {
            // Not provisioned downstream yet; nothing to poll.
            return Ok(());
        };

        let jobs = self
            .engine
            .list_jobs(external_id, self.jobs_per_connection)
            .await?;
        self.registry.touch_health(&connection.id).await?;

        for job in &jobs {
            if !job.is_failed() {
                continue;
            }
            if self.job_already_recorded(&job.id).await? {
                continue;
            }

            let logs = self.engine.get_job_logs(&job.id).await?;
            if logs.trim().is_empty() {
                tracing::debug!(job_id = %job.id, "failed job has no logs, cannot classify");
                continue;
            }
            if !self.classifier.is_schema_drift(&logs) {
                continue;
            }

            self.record_drift(connection, job, &logs).await?;
            // At most one detection per connection per cycle.
            break;
        }
        Ok(())
    }

    async fn job_already_recorded(&self, external_job_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM job_history WHERE external_job_id = ?",
        )
        .bind(external_job_id)
        .fetch_one(self.registry.pool())
        .await?;
        Ok(exists)
    }

    /// Transition to DRIFTED, record the failed job, and publish the drift
    /// event carrying the last-known-good catalog.
    ///
    /// The status and job-history writes share one transaction with the
    /// baseline lookup: a connection with no catalog version rolls back and
    /// publishes nothing.
    async fn record_drift(
        &self,
        connection: &Connection,
        job: &JobSummary,
        logs: &str,
    ) -> Result<()> {
        let error_signature = truncate_error(logs);
        let now = Utc::now().timestamp();
        let mut tx = self.registry.pool().begin().await?;

        sqlx::query("UPDATE connections SET status = ?, updated_at = ? WHERE id = ?")
            .bind(ConnectionStatus::Drifted.as_str())
            .bind(now)
            .bind(&connection.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO job_history (id, connection_id, external_job_id, status, error_message, created_at)
            VALUES (?, ?, ?, 'FAILED', ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&connection.id)
        .bind(&job.id)
        .bind(&error_signature)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let last_good_json: Option<String> = sqlx::query_scalar(
            "SELECT catalog_json FROM catalog_versions WHERE connection_id = ? ORDER BY version_number DESC LIMIT 1",
        )
        .bind(&connection.id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(last_good_json) = last_good_json else {
            tx.rollback().await?;
            tracing::warn!(
                connection_id = %connection.id,
                job_id = %job.id,
                "drift classified but no baseline catalog exists, cannot propose a repair"
            );
            return Ok(());
        };

        tx.commit().await?;

        tracing::info!(
            connection_id = %connection.id,
            job_id = %job.id,
            "schema drift detected"
        );

        self.bus.publish(
            DRIFT_DETECTED,
            &DriftEvent {
                connection_id: connection.id.clone(),
                error_signature,
                last_good_catalog: serde_json::from_str(&last_good_json)?,
            },
        )?;
        self.bus.publish(
            STATUS_UPDATE,
            &StatusUpdate {
                connection_id: connection.id.clone(),
                status: ConnectionStatus::Drifted,
                message: Some(format!("schema drift detected in job {}", job.id)),
            },
        )?;
        Ok(())
    }
}
