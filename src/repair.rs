//! Repair agent — decides whether a proposed catalog is applied
//! autonomously or routed to a human, and performs the apply.
//!
//! The autonomous path runs under the registry's per-connection lock so
//! two repair attempts on one connection can never both append a catalog
//! version. The validation sync triggered after an apply is observed but
//! never awaited; its downstream outcome does not gate the ACTIVE
//! transition.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::Arc;

use crate::bus::{EventBus, REPAIR_PROPOSED, STATUS_UPDATE};
use crate::catalog;
use crate::knowledge::KnowledgeStore;
use crate::models::{truncate_error, Connection, ConnectionStatus, RepairProposal, StatusUpdate};
use crate::registry::ConnectionRegistry;
use crate::sync_engine::SyncEngine;

/// Proposals must score strictly above this to be applied without a human.
pub const CONFIDENCE_THRESHOLD: f64 = 0.90;

pub struct RepairAgent {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<dyn SyncEngine>,
    knowledge: Arc<KnowledgeStore>,
    bus: Arc<EventBus>,
    threshold: f64,
}

impl RepairAgent {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<dyn SyncEngine>,
        knowledge: Arc<KnowledgeStore>,
        bus: Arc<EventBus>,
        threshold: f64,
    ) -> Self {
        Self {
            registry,
            engine,
            knowledge,
            bus,
            threshold,
        }
    }

    /// Register this agent as the `repair_proposed` handler.
    pub fn subscribe(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        self.bus.subscribe(REPAIR_PROPOSED, move |value| {
            let agent = Arc::clone(&agent);
            async move {
                let proposal: RepairProposal = serde_json::from_value(value)?;
                agent.handle_proposal(proposal).await
            }
        });
    }

    pub async fn handle_proposal(&self, proposal: RepairProposal) -> Result<()> {
        let Some(connection) = self.registry.get(&proposal.connection_id).await? else {
            tracing::warn!(
                connection_id = %proposal.connection_id,
                "proposal for unknown connection dropped"
            );
            return Ok(());
        };

        if proposal.confidence > self.threshold {
            tracing::info!(
                connection_id = %connection.id,
                confidence = proposal.confidence,
                "confidence above threshold, applying repair autonomously"
            );
            match self
                .apply_and_version(
                    &connection,
                    &proposal.proposed_catalog,
                    Some((&proposal.error_signature, proposal.confidence)),
                )
                .await
            {
                Ok(version) => {
                    tracing::info!(
                        connection_id = %connection.id,
                        version,
                        "autonomous repair applied"
                    );
                }
                Err(e) => {
                    // Status is already FAILED and published.
                    tracing::error!(
                        connection_id = %connection.id,
                        error = %e,
                        "autonomous repair failed"
                    );
                }
            }
            Ok(())
        } else {
            tracing::info!(
                connection_id = %connection.id,
                confidence = proposal.confidence,
                "confidence at or below threshold, routing to manual review"
            );
            if self
                .registry
                .update_status(&connection.id, ConnectionStatus::ManualReviewRequired)
                .await?
                .is_none()
            {
                tracing::warn!(connection_id = %connection.id, "connection vanished before manual routing");
                return Ok(());
            }
            self.bus.publish(
                STATUS_UPDATE,
                &StatusUpdate {
                    connection_id: connection.id.clone(),
                    status: ConnectionStatus::ManualReviewRequired,
                    message: Some(format!(
                        "confidence {:.4} did not exceed threshold {:.2}",
                        proposal.confidence, self.threshold
                    )),
                },
            )?;
            Ok(())
        }
    }

    /// Operator-invoked apply: same versioning and status semantics as the
    /// autonomous path, no confidence gate, no feedback record.
    pub async fn apply_catalog(&self, connection_id: &str, catalog: &Value) -> Result<i64> {
        let connection = self
            .registry
            .get(connection_id)
            .await?
            .ok_or_else(|| anyhow!("Connection not found: {}", connection_id))?;
        self.apply_and_version(&connection, catalog, None).await
    }

    /// HEALING → apply downstream → version → validation sync → ACTIVE,
    /// all under the per-connection lock. On any error the connection is
    /// left FAILED with a truncated message published; no version row is
    /// written when the external apply itself failed.
    async fn apply_and_version(
        &self,
        connection: &Connection,
        catalog: &Value,
        feedback: Option<(&str, f64)>,
    ) -> Result<i64> {
        let lock = self.registry.connection_lock(&connection.id);
        let _guard = lock.lock().await;

        if self
            .registry
            .update_status(&connection.id, ConnectionStatus::Healing)
            .await?
            .is_none()
        {
            return Err(anyhow!("Connection disappeared: {}", connection.id));
        }
        self.bus.publish(
            STATUS_UPDATE,
            &StatusUpdate {
                connection_id: connection.id.clone(),
                status: ConnectionStatus::Healing,
                message: Some("applying repaired catalog".to_string()),
            },
        )?;

        match self.push_and_record(connection, catalog).await {
            Ok(version) => {
                self.registry
                    .update_status(&connection.id, ConnectionStatus::Active)
                    .await?;
                self.bus.publish(
                    STATUS_UPDATE,
                    &StatusUpdate {
                        connection_id: connection.id.clone(),
                        status: ConnectionStatus::Active,
                        message: Some(format!("catalog version {} applied", version)),
                    },
                )?;

                if let Some((error_signature, confidence)) = feedback {
                    if let Err(e) = self
                        .knowledge
                        .append(&connection.source_type, error_signature, catalog, confidence)
                        .await
                    {
                        // The repair itself succeeded; losing one feedback
                        // record must not fail the connection.
                        tracing::warn!(error = %e, "could not store repair feedback");
                    }
                }
                Ok(version)
            }
            Err(e) => {
                self.registry
                    .update_status(&connection.id, ConnectionStatus::Failed)
                    .await?;
                self.bus.publish(
                    STATUS_UPDATE,
                    &StatusUpdate {
                        connection_id: connection.id.clone(),
                        status: ConnectionStatus::Failed,
                        message: Some(truncate_error(&format!("repair failed: {}", e))),
                    },
                )?;
                Err(e)
            }
        }
    }

    async fn push_and_record(&self, connection: &Connection, catalog: &Value) -> Result<i64> {
        let external_id = connection
            .external_connection_id
            .as_deref()
            .ok_or_else(|| anyhow!("Connection has no downstream identifier"))?;

        // A failure here aborts before any version row exists.
        self.engine.update_connection(external_id, catalog).await?;

        let version = catalog::append(self.registry.pool(), &connection.id, catalog).await?;

        // Fire and forget: the trigger call must succeed, but the sync's
        // downstream outcome is not awaited and does not gate ACTIVE.
        let job_id = self.engine.trigger_sync(external_id).await?;
        tracing::info!(
            connection_id = %connection.id,
            job_id = %job_id,
            "validation sync triggered"
        );

        Ok(version)
    }
}
