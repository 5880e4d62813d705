//! Core data models for managed connections and their repair lifecycle.
//!
//! These types represent the connections, catalog versions, job records,
//! and bus messages that flow through the drift-detection pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of error text stored in job history or carried on the bus.
pub const MAX_ERROR_LEN: usize = 500;

/// Truncate error text to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_LEN).collect()
    }
}

/// Lifecycle state of a managed connection.
///
/// `PENDING → ACTIVE ⇄ DRIFTED → HEALING → ACTIVE`, with `FAILED` and
/// `MANUAL_REVIEW_REQUIRED` reachable from DRIFTED/HEALING and `INACTIVE`
/// reachable from ACTIVE via explicit disconnect. No state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Pending,
    Active,
    Drifted,
    Healing,
    Failed,
    ManualReviewRequired,
    Inactive,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "PENDING",
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Drifted => "DRIFTED",
            ConnectionStatus::Healing => "HEALING",
            ConnectionStatus::Failed => "FAILED",
            ConnectionStatus::ManualReviewRequired => "MANUAL_REVIEW_REQUIRED",
            ConnectionStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ConnectionStatus::Pending),
            "ACTIVE" => Some(ConnectionStatus::Active),
            "DRIFTED" => Some(ConnectionStatus::Drifted),
            "HEALING" => Some(ConnectionStatus::Healing),
            "FAILED" => Some(ConnectionStatus::Failed),
            "MANUAL_REVIEW_REQUIRED" => Some(ConnectionStatus::ManualReviewRequired),
            "INACTIVE" => Some(ConnectionStatus::Inactive),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One external data source under management.
///
/// `status` is the single authoritative lifecycle field; it is mutated only
/// through the registry's status-transition operations.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub source_type: String,
    /// Identifier of the source in the external sync engine. None until the
    /// onboarding flow has created it downstream.
    pub external_source_id: Option<String>,
    /// Identifier of the connection in the external sync engine.
    pub external_connection_id: Option<String>,
    pub status: ConnectionStatus,
    pub last_health_check: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One immutable snapshot of a connection's schema mapping.
///
/// For a given connection, `version_number` starts at 1 and increases by
/// exactly 1 with no gaps or reuse. Rows are append-only.
#[derive(Debug, Clone)]
pub struct SyncCatalogVersion {
    pub id: String,
    pub connection_id: String,
    pub catalog: Value,
    pub version_number: i64,
    pub created_at: i64,
}

/// One record per observed synchronization attempt acted on by the observer.
///
/// At most one row exists per external job id; the observer treats an
/// already-recorded id as already processed.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub connection_id: String,
    pub external_job_id: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: i64,
}

/// One confirmed successful repair, kept as few-shot context for future
/// proposals.
#[derive(Debug, Clone)]
pub struct RepairKnowledgeRecord {
    pub id: String,
    pub source_type: String,
    pub error_signature: String,
    pub catalog: Value,
    pub confidence: f64,
    pub created_at: i64,
}

/// A historical repair returned by the similarity index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarRepair {
    pub source_type: String,
    pub error_signature: String,
    pub successful_catalog: Value,
    pub confidence: f64,
}

/// Published on `drift_detected` when the observer classifies a failed job
/// as schema drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEvent {
    pub connection_id: String,
    pub error_signature: String,
    pub last_good_catalog: Value,
}

/// Published on `repair_proposed` when the proposer has a validated
/// candidate catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairProposal {
    pub connection_id: String,
    pub proposed_catalog: Value,
    /// Confidence in [0.0, 1.0]; gates autonomous vs. manual application.
    pub confidence: f64,
    pub error_signature: String,
}

/// Published on `status_update` for every lifecycle transition, so any
/// subscriber (e.g. a dashboard) can follow connection state live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub connection_id: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
