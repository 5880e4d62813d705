//! # Schema Sentinel CLI (`sentinel`)
//!
//! The `sentinel` binary is the operator interface for Schema Sentinel.
//! It provides commands for database initialization, connection
//! onboarding, the long-running drift control loop, manual catalog
//! application, and live status watching.
//!
//! ## Usage
//!
//! ```bash
//! sentinel --config ./config/sentinel.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sentinel init` | Create the SQLite database and run schema migrations |
//! | `sentinel onboard <name>` | Register and provision a new connection |
//! | `sentinel connections` | List managed connections and lifecycle state |
//! | `sentinel history <id>` | Show catalog versions and job history |
//! | `sentinel run` | Start the observer/proposer/repair control loop |
//! | `sentinel apply <id>` | Apply a specific catalog now (operator path) |
//! | `sentinel disconnect <id>` | Take an active connection to INACTIVE |
//! | `sentinel delete <id>` | Remove a connection and all its history |
//! | `sentinel watch` | Follow status transitions as they happen |

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use schema_sentinel::config::{self, Config};
use schema_sentinel::daemon;
use schema_sentinel::generation::validate_catalog;
use schema_sentinel::models::ConnectionStatus;
use schema_sentinel::onboard;
use schema_sentinel::registry::ConnectionRegistry;
use schema_sentinel::{catalog, db, migrate};

/// Schema Sentinel — self-healing schema drift detection and repair for
/// managed data connections.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sentinel.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sentinel",
    about = "Schema Sentinel — self-healing schema drift detection and repair",
    version,
    long_about = "Schema Sentinel onboards external data connections, watches their \
    synchronization jobs for schema-compatibility failures, and repairs detected drift by \
    generating a corrected sync catalog — autonomously when confidence is high, or by \
    routing to a human otherwise."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sentinel.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (connections, catalog_versions, job_history, repair_knowledge).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Register a new connection and provision it downstream.
    ///
    /// Creates the source in the sync engine, discovers its schema,
    /// creates the downstream connection, and stores the discovered
    /// catalog as version 1. The connection ends in ACTIVE, or FAILED
    /// if any provisioning step errors.
    Onboard {
        /// Human-readable connection name.
        name: String,

        /// Source type tag (e.g. `postgres`, `mysql`, `s3`).
        #[arg(long)]
        source_type: String,

        /// Path to a JSON file with source-specific configuration.
        /// Defaults to an empty configuration object.
        #[arg(long)]
        source_config: Option<PathBuf>,
    },

    /// List managed connections and their lifecycle state.
    Connections {
        /// Filter by status (e.g. ACTIVE, DRIFTED, MANUAL_REVIEW_REQUIRED).
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a connection's catalog versions and recorded job failures.
    History {
        /// Connection id.
        id: String,
    },

    /// Start the drift control loop (observer, proposer, repair agent).
    ///
    /// Runs until ctrl-c. The observer polls watched connections on the
    /// configured interval; repairs are applied autonomously above the
    /// confidence threshold and routed to manual review otherwise.
    Run,

    /// Apply a specific catalog to a connection now.
    ///
    /// The operator-invoked repair path: identical versioning and status
    /// semantics to the autonomous path, but no confidence gate.
    Apply {
        /// Connection id.
        id: String,

        /// Path to the catalog JSON document to apply.
        #[arg(long)]
        catalog: PathBuf,
    },

    /// Take an active connection to INACTIVE.
    Disconnect {
        /// Connection id.
        id: String,
    },

    /// Delete a connection and all its catalog versions and job history.
    Delete {
        /// Connection id.
        id: String,
    },

    /// Follow connection status transitions as they happen.
    Watch {
        /// Seconds between registry polls.
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Onboard {
            name,
            source_type,
            source_config,
        } => {
            run_onboard(&cfg, &name, &source_type, source_config).await?;
        }
        Commands::Connections { status } => {
            run_connections(&cfg, status).await?;
        }
        Commands::History { id } => {
            run_history(&cfg, &id).await?;
        }
        Commands::Run => {
            daemon::run_daemon(&cfg).await?;
        }
        Commands::Apply { id, catalog } => {
            run_apply(&cfg, &id, &catalog).await?;
        }
        Commands::Disconnect { id } => {
            run_disconnect(&cfg, &id).await?;
        }
        Commands::Delete { id } => {
            run_delete(&cfg, &id).await?;
        }
        Commands::Watch { interval_secs } => {
            run_watch(&cfg, interval_secs).await?;
        }
    }

    Ok(())
}

async fn run_onboard(
    cfg: &Config,
    name: &str,
    source_type: &str,
    source_config: Option<PathBuf>,
) -> Result<()> {
    let source_config = match source_config {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read source config: {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| "Source config is not valid JSON")?
        }
        None => serde_json::json!({}),
    };

    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;
    let registry = ConnectionRegistry::new(pool);

    let engine: Arc<dyn schema_sentinel::sync_engine::SyncEngine> =
        Arc::new(schema_sentinel::sync_engine::HttpSyncEngine::new(&cfg.sync_engine)?);
    let connection = onboard::onboard(&registry, &engine, name, source_type, &source_config).await?;

    println!("onboard {}", name);
    println!("  connection id: {}", connection.id);
    println!("  status: {}", connection.status);
    println!("ok");
    Ok(())
}

async fn run_connections(cfg: &Config, status: Option<String>) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let registry = ConnectionRegistry::new(pool);

    let connections = match status {
        Some(text) => {
            let Some(status) = ConnectionStatus::parse(&text) else {
                bail!("Unknown status: {}", text);
            };
            registry.list_by_status(&[status]).await?
        }
        None => registry.list_all().await?,
    };

    if connections.is_empty() {
        println!("No connections.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<12} {:<24} LAST HEALTH CHECK",
        "ID", "NAME", "TYPE", "STATUS"
    );
    for conn in connections {
        let health = conn
            .last_health_check
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<38} {:<20} {:<12} {:<24} {}",
            conn.id, conn.name, conn.source_type, conn.status.as_str(), health
        );
    }
    Ok(())
}

async fn run_history(cfg: &Config, id: &str) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let registry = ConnectionRegistry::new(pool.clone());

    let Some(connection) = registry.get(id).await? else {
        bail!("Connection not found: {}", id);
    };

    println!("{} ({})", connection.name, connection.status);

    let versions = catalog::list(&pool, id).await?;
    println!("catalog versions: {}", versions.len());
    for version in &versions {
        let created = DateTime::from_timestamp(version.created_at, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("  v{}  {}", version.version_number, created);
    }

    let jobs = registry.job_history(id).await?;
    println!("recorded job failures: {}", jobs.len());
    for job in &jobs {
        println!(
            "  job {}  {}  {}",
            job.external_job_id,
            job.status,
            job.error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn run_apply(cfg: &Config, id: &str, catalog_path: &PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(catalog_path)
        .with_context(|| format!("Failed to read catalog: {}", catalog_path.display()))?;
    let raw: serde_json::Value =
        serde_json::from_str(&content).with_context(|| "Catalog file is not valid JSON")?;
    let catalog = validate_catalog(&raw)?;

    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;
    let services = daemon::build_services(cfg, pool)?;
    services.bus.connect();

    let version = services.agent.apply_catalog(id, &catalog).await?;
    println!("apply {}", id);
    println!("  catalog version: {}", version);
    println!("ok");

    services.bus.disconnect().await;
    Ok(())
}

async fn run_disconnect(cfg: &Config, id: &str) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let registry = ConnectionRegistry::new(pool);

    let Some(connection) = registry.get(id).await? else {
        bail!("Connection not found: {}", id);
    };
    if connection.status != ConnectionStatus::Active {
        bail!(
            "Only ACTIVE connections can be disconnected (current: {})",
            connection.status
        );
    }

    registry
        .update_status(id, ConnectionStatus::Inactive)
        .await?;
    println!("disconnected {}", id);
    Ok(())
}

async fn run_delete(cfg: &Config, id: &str) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let registry = ConnectionRegistry::new(pool);

    if registry.delete(id).await? {
        println!("deleted {}", id);
    } else {
        bail!("Connection not found: {}", id);
    }
    Ok(())
}

/// Poll the registry and print every status transition. This reads the
/// same persisted status field the services write, so it works from a
/// separate process.
async fn run_watch(cfg: &Config, interval_secs: u64) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let registry = ConnectionRegistry::new(pool);

    println!("watching connection status (ctrl-c to stop)");
    let mut seen: HashMap<String, ConnectionStatus> = HashMap::new();

    loop {
        let connections = registry.list_all().await?;
        for conn in connections {
            match seen.get(&conn.id) {
                Some(previous) if *previous == conn.status => {}
                previous => {
                    let now = chrono::Utc::now().format("%H:%M:%S");
                    match previous {
                        Some(previous) => println!(
                            "[{}] {} ({}): {} -> {}",
                            now, conn.name, conn.id, previous, conn.status
                        ),
                        None => {
                            println!("[{}] {} ({}): {}", now, conn.name, conn.id, conn.status)
                        }
                    }
                    seen.insert(conn.id.clone(), conn.status);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval_secs)) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
