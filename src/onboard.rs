//! Onboarding flow for a new managed connection.
//!
//! Registers the connection, provisions it downstream in the sync engine,
//! and stores the discovered schema as catalog version 1 — the baseline
//! every later drift repair starts from.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

use crate::catalog;
use crate::models::{Connection, ConnectionStatus};
use crate::registry::ConnectionRegistry;
use crate::sync_engine::SyncEngine;

/// Register and provision a connection end to end.
///
/// On any downstream failure the connection is left in FAILED rather than
/// being rolled back, so the operator can inspect and retry.
pub async fn onboard(
    registry: &ConnectionRegistry,
    engine: &Arc<dyn SyncEngine>,
    name: &str,
    source_type: &str,
    source_config: &Value,
) -> Result<Connection> {
    let connection = registry.register(name, source_type).await?;
    tracing::info!(connection_id = %connection.id, name, source_type, "connection registered");

    match provision(registry, engine, &connection, name, source_type, source_config).await {
        Ok(connection) => Ok(connection),
        Err(e) => {
            registry
                .update_status(&connection.id, ConnectionStatus::Failed)
                .await?;
            tracing::error!(connection_id = %connection.id, error = %e, "onboarding failed");
            Err(e)
        }
    }
}

async fn provision(
    registry: &ConnectionRegistry,
    engine: &Arc<dyn SyncEngine>,
    connection: &Connection,
    name: &str,
    source_type: &str,
    source_config: &Value,
) -> Result<Connection> {
    let source_id = engine.create_source(name, source_type, source_config).await?;
    let discovered = engine.discover_schema(&source_id).await?;
    let external_connection_id = engine.create_connection(&source_id, name).await?;

    registry
        .set_external_ids(&connection.id, &source_id, &external_connection_id)
        .await?;

    let version = catalog::append(registry.pool(), &connection.id, &discovered).await?;
    tracing::info!(
        connection_id = %connection.id,
        version,
        "baseline catalog stored"
    );

    let active = registry
        .update_status(&connection.id, ConnectionStatus::Active)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Connection disappeared during onboarding"))?;
    Ok(active)
}
