//! Service construction and the long-running `sentinel run` entry point.
//!
//! The observer, proposer, and repair agent are explicitly constructed
//! here and wired together through one event bus and one registry; there
//! are no process-wide singletons. Shutdown is cooperative: ctrl-c flips
//! a watch channel, the observer finishes its current cycle, and the bus
//! listener is cancelled last.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::watch;

use crate::bus::{EventBus, STATUS_UPDATE};
use crate::classify::KeywordClassifier;
use crate::config::Config;
use crate::db;
use crate::generation::HttpGenerator;
use crate::knowledge::KnowledgeStore;
use crate::migrate;
use crate::models::StatusUpdate;
use crate::observer::SchemaObserver;
use crate::proposer::{ParseSuccessPolicy, RepairProposer};
use crate::registry::ConnectionRegistry;
use crate::repair::RepairAgent;
use crate::sync_engine::{HttpSyncEngine, SyncEngine};

pub struct Services {
    pub bus: Arc<EventBus>,
    pub registry: Arc<ConnectionRegistry>,
    pub observer: Arc<SchemaObserver>,
    pub proposer: Arc<RepairProposer>,
    pub agent: Arc<RepairAgent>,
}

/// Build the three services against one pool, one bus, and the production
/// HTTP collaborators.
pub fn build_services(config: &Config, pool: SqlitePool) -> Result<Services> {
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(ConnectionRegistry::new(pool.clone()));
    let engine: Arc<dyn SyncEngine> = Arc::new(HttpSyncEngine::new(&config.sync_engine)?);
    let knowledge = Arc::new(KnowledgeStore::new(pool, config.embedding.clone()));
    let generator = Arc::new(HttpGenerator::new(&config.generation)?);

    let observer = Arc::new(SchemaObserver::new(
        Arc::clone(&registry),
        Arc::clone(&engine),
        Arc::clone(&bus),
        Box::new(KeywordClassifier::new()),
        &config.observer,
    ));
    let proposer = Arc::new(RepairProposer::new(
        Arc::clone(&registry),
        Arc::clone(&knowledge) as Arc<dyn crate::knowledge::SimilarityIndex>,
        generator,
        Arc::clone(&bus),
        Box::new(ParseSuccessPolicy),
        &config.repair,
    ));
    let agent = Arc::new(RepairAgent::new(
        Arc::clone(&registry),
        engine,
        knowledge,
        Arc::clone(&bus),
        config.repair.confidence_threshold,
    ));

    Ok(Services {
        bus,
        registry,
        observer,
        proposer,
        agent,
    })
}

/// Run the full control loop until ctrl-c.
pub async fn run_daemon(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;

    let services = build_services(config, pool)?;

    services.bus.connect();
    services.proposer.subscribe();
    services.agent.subscribe();
    services.bus.subscribe(STATUS_UPDATE, |value| async move {
        let update: StatusUpdate = serde_json::from_value(value)?;
        tracing::info!(
            connection_id = %update.connection_id,
            status = %update.status,
            message = update.message.as_deref().unwrap_or(""),
            "status update"
        );
        Ok(())
    });
    services.bus.start_listening();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let observer = Arc::clone(&services.observer);
    let observer_task = tokio::spawn(async move {
        observer.run(shutdown_rx).await;
    });

    println!("sentinel running. Press ctrl-c to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    observer_task.await?;
    services.bus.disconnect().await;

    println!("stopped.");
    Ok(())
}
