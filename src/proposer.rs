//! Repair proposer — turns drift events into candidate catalogs.
//!
//! On every `drift_detected` message: retrieve similar historical repairs
//! (a failed lookup degrades to an empty list), ask the generation
//! service for a corrected catalog, validate the untrusted output, score
//! it, and publish a `repair_proposed` message. The proposer never
//! mutates connection status except to route a failed generation to
//! manual review.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::bus::{EventBus, DRIFT_DETECTED, REPAIR_PROPOSED, STATUS_UPDATE};
use crate::config::RepairConfig;
use crate::generation::{validate_catalog, CatalogGenerator, GenerationRequest};
use crate::knowledge::SimilarityIndex;
use crate::models::{ConnectionStatus, DriftEvent, RepairProposal, StatusUpdate};
use crate::registry::ConnectionRegistry;

/// Scores a validated proposal. Pluggable so the parse-success default can
/// be replaced by a real scoring model without touching the proposer.
pub trait ConfidencePolicy: Send + Sync {
    fn score(&self, proposal: &Value, request: &GenerationRequest) -> f64;
}

/// Default policy: any proposal that parsed and validated scores 0.95.
///
/// This makes the downstream confidence gate a parse-success gate in
/// practice, which is the intended baseline behavior.
pub struct ParseSuccessPolicy;

impl ConfidencePolicy for ParseSuccessPolicy {
    fn score(&self, _proposal: &Value, _request: &GenerationRequest) -> f64 {
        0.95
    }
}

pub struct RepairProposer {
    registry: Arc<ConnectionRegistry>,
    index: Arc<dyn SimilarityIndex>,
    generator: Arc<dyn CatalogGenerator>,
    bus: Arc<EventBus>,
    policy: Box<dyn ConfidencePolicy>,
    history_top_k: usize,
    few_shot_limit: usize,
}

impl RepairProposer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        index: Arc<dyn SimilarityIndex>,
        generator: Arc<dyn CatalogGenerator>,
        bus: Arc<EventBus>,
        policy: Box<dyn ConfidencePolicy>,
        config: &RepairConfig,
    ) -> Self {
        Self {
            registry,
            index,
            generator,
            bus,
            policy,
            history_top_k: config.history_top_k,
            few_shot_limit: config.few_shot_limit,
        }
    }

    /// Register this proposer as the `drift_detected` handler.
    pub fn subscribe(self: &Arc<Self>) {
        let proposer = Arc::clone(self);
        self.bus.subscribe(DRIFT_DETECTED, move |value| {
            let proposer = Arc::clone(&proposer);
            async move {
                let event: DriftEvent = serde_json::from_value(value)?;
                proposer.handle_drift(event).await
            }
        });
    }

    pub async fn handle_drift(&self, event: DriftEvent) -> Result<()> {
        tracing::info!(connection_id = %event.connection_id, "proposing repair for drift");

        let historical = match self
            .index
            .find_similar(&event.error_signature, self.history_top_k)
            .await
        {
            Ok(repairs) => repairs,
            Err(e) => {
                tracing::warn!(error = %e, "similarity lookup failed, proceeding without context");
                Vec::new()
            }
        };

        let mut request = GenerationRequest {
            error_signature: event.error_signature.clone(),
            last_good_catalog: event.last_good_catalog.clone(),
            historical_repairs: historical,
        };
        request.historical_repairs.truncate(self.few_shot_limit);

        let proposed = match self.generator.propose(&request).await {
            Ok(raw) => match validate_catalog(&raw) {
                Ok(catalog) => catalog,
                Err(e) => {
                    tracing::warn!(
                        connection_id = %event.connection_id,
                        error = %e,
                        "generated catalog failed validation"
                    );
                    return self.route_to_manual_review(&event.connection_id).await;
                }
            },
            Err(e) => {
                tracing::warn!(
                    connection_id = %event.connection_id,
                    error = %e,
                    "catalog generation failed"
                );
                return self.route_to_manual_review(&event.connection_id).await;
            }
        };

        let confidence = self.policy.score(&proposed, &request).clamp(0.0, 1.0);

        tracing::info!(
            connection_id = %event.connection_id,
            confidence,
            "repair proposed"
        );
        self.bus.publish(
            REPAIR_PROPOSED,
            &RepairProposal {
                connection_id: event.connection_id,
                proposed_catalog: proposed,
                confidence,
                error_signature: event.error_signature,
            },
        )?;
        Ok(())
    }

    async fn route_to_manual_review(&self, connection_id: &str) -> Result<()> {
        let updated = self
            .registry
            .update_status(connection_id, ConnectionStatus::ManualReviewRequired)
            .await?;
        if updated.is_none() {
            tracing::warn!(connection_id, "connection vanished before manual routing");
            return Ok(());
        }
        self.bus.publish(
            STATUS_UPDATE,
            &StatusUpdate {
                connection_id: connection_id.to_string(),
                status: ConnectionStatus::ManualReviewRequired,
                message: Some("generation failed".to_string()),
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_success_policy_is_constant() {
        let policy = ParseSuccessPolicy;
        let request = GenerationRequest {
            error_signature: "column not found".to_string(),
            last_good_catalog: json!({"streams": []}),
            historical_repairs: Vec::new(),
        };
        assert_eq!(policy.score(&json!({"streams": [1]}), &request), 0.95);
    }
}
