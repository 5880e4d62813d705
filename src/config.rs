use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    pub sync_engine: SyncEngineConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObserverConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How many recent jobs to inspect per connection each cycle.
    #[serde(default = "default_jobs_per_connection")]
    pub jobs_per_connection: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            jobs_per_connection: default_jobs_per_connection(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_jobs_per_connection() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepairConfig {
    /// Proposals must score strictly above this to be applied autonomously.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// How many historical repairs to retrieve per drift event.
    #[serde(default = "default_history_top_k")]
    pub history_top_k: usize,
    /// How many of the retrieved repairs go into the generation prompt.
    #[serde(default = "default_few_shot_limit")]
    pub few_shot_limit: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            history_top_k: default_history_top_k(),
            few_shot_limit: default_few_shot_limit(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.90
}
fn default_history_top_k() -> usize {
    5
}
fn default_few_shot_limit() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncEngineConfig {
    pub base_url: String,
    pub client_id: String,
    /// Name of the environment variable holding the client secret.
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_engine_max_retries")]
    pub max_retries: u32,
}

fn default_client_secret_env() -> String {
    "SYNC_ENGINE_CLIENT_SECRET".to_string()
}
fn default_engine_timeout_secs() -> u64 {
    30
}
fn default_engine_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_max_retries")]
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_generation_base_url(),
            model: default_generation_model(),
            api_key_env: default_generation_api_key_env(),
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_generation_max_retries(),
        }
    }
}

fn default_generation_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_generation_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_generation_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            max_retries: default_embedding_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate observer
    if config.observer.poll_interval_secs == 0 {
        anyhow::bail!("observer.poll_interval_secs must be > 0");
    }
    if config.observer.jobs_per_connection == 0 {
        anyhow::bail!("observer.jobs_per_connection must be > 0");
    }

    // Validate repair
    if !(0.0..=1.0).contains(&config.repair.confidence_threshold) {
        anyhow::bail!("repair.confidence_threshold must be in [0.0, 1.0]");
    }
    if config.repair.few_shot_limit > config.repair.history_top_k {
        anyhow::bail!("repair.few_shot_limit must not exceed repair.history_top_k");
    }

    // Validate sync engine
    if config.sync_engine.base_url.trim().is_empty() {
        anyhow::bail!("sync_engine.base_url must not be empty");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}
