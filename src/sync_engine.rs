//! Client boundary for the external sync engine.
//!
//! The observer and repair agent only ever see the [`SyncEngine`] trait;
//! [`HttpSyncEngine`] is the production implementation. Auth is a cached
//! bearer token refreshed on expiry, with exactly one automatic
//! refresh-and-retry when a request comes back 401.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SyncEngineConfig;

/// A job reported by the engine for one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub status: String,
}

impl JobSummary {
    pub fn is_failed(&self) -> bool {
        self.status.eq_ignore_ascii_case("failed")
    }
}

/// Operations the core consumes from the sync engine. See the production
/// [`HttpSyncEngine`] for the wire mapping; tests substitute mocks.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    async fn create_source(&self, name: &str, source_type: &str, config: &Value) -> Result<String>;

    /// Discover the source's current schema as a catalog document.
    async fn discover_schema(&self, source_id: &str) -> Result<Value>;

    async fn create_connection(&self, source_id: &str, name: &str) -> Result<String>;

    /// Replace the connection's sync catalog downstream.
    async fn update_connection(&self, external_connection_id: &str, catalog: &Value) -> Result<()>;

    /// Kick off a sync run; returns the new job id.
    async fn trigger_sync(&self, external_connection_id: &str) -> Result<String>;

    /// Most recent jobs, newest first.
    async fn list_jobs(&self, external_connection_id: &str, limit: usize)
        -> Result<Vec<JobSummary>>;

    async fn get_job_logs(&self, job_id: &str) -> Result<String>;
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Bearer-token HTTP client for the engine's REST API.
pub struct HttpSyncEngine {
    config: SyncEngineConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

/// Refresh the token this many seconds before its reported expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 30;

impl HttpSyncEngine {
    pub fn new(config: &SyncEngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            client,
            token: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn invalidate_token(&self) {
        *self.token.lock().unwrap() = None;
    }

    async fn bearer_token(&self) -> Result<String> {
        {
            let cached = self.token.lock().unwrap();
            if let Some(t) = cached.as_ref() {
                if Utc::now().timestamp() < t.expires_at - TOKEN_EXPIRY_MARGIN_SECS {
                    return Ok(t.token.clone());
                }
            }
        }

        let secret = std::env::var(&self.config.client_secret_env).map_err(|_| {
            anyhow!(
                "{} environment variable not set",
                self.config.client_secret_env
            )
        })?;

        let response = self
            .client
            .post(self.endpoint("applications/token"))
            .json(&json!({
                "client_id": self.config.client_id,
                "client_secret": secret,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Sync engine token request failed {}: {}", status, text);
        }

        let body: Value = response.json().await?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("Token response missing access_token"))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(180);

        *self.token.lock().unwrap() = Some(CachedToken {
            token: token.clone(),
            expires_at: Utc::now().timestamp() + expires_in,
        });
        Ok(token)
    }

    /// Send an authorized request with bounded retry.
    ///
    /// 401 triggers one token refresh and one immediate re-send; 429 and
    /// 5xx retry with exponential backoff up to `max_retries`; other 4xx
    /// fail immediately.
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.endpoint(path);
        let mut attempt: u32 = 0;
        let mut auth_retried = false;
        let mut last_err: Option<anyhow::Error> = None;

        loop {
            let token = self.bearer_token().await?;
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", format!("Bearer {}", token));
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        if status == reqwest::StatusCode::NO_CONTENT {
                            return Ok(Value::Null);
                        }
                        let text = response.text().await?;
                        if text.trim().is_empty() {
                            return Ok(Value::Null);
                        }
                        return Ok(serde_json::from_str(&text)?);
                    }

                    if status == reqwest::StatusCode::UNAUTHORIZED && !auth_retried {
                        auth_retried = true;
                        self.invalidate_token();
                        continue;
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("Sync engine error {}: {}", status, text));
                    } else {
                        let text = response.text().await.unwrap_or_default();
                        bail!("Sync engine error {}: {}", status, text);
                    }
                }
                Err(e) => last_err = Some(e.into()),
            }

            if attempt >= self.config.max_retries {
                return Err(
                    last_err.unwrap_or_else(|| anyhow!("Sync engine request failed after retries"))
                );
            }
            attempt += 1;
            // Exponential backoff: 1s, 2s, 4s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SyncEngine for HttpSyncEngine {
    async fn create_source(&self, name: &str, source_type: &str, config: &Value) -> Result<String> {
        let body = json!({
            "name": name,
            "sourceType": source_type,
            "configuration": config,
        });
        let response = self.request(Method::POST, "sources", Some(&body)).await?;
        response["sourceId"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Create-source response missing sourceId"))
    }

    async fn discover_schema(&self, source_id: &str) -> Result<Value> {
        let path = format!("sources/{}/discover_schema", source_id);
        let response = self.request(Method::POST, &path, None).await?;
        response
            .get("catalog")
            .cloned()
            .ok_or_else(|| anyhow!("Discover-schema response missing catalog"))
    }

    async fn create_connection(&self, source_id: &str, name: &str) -> Result<String> {
        let body = json!({
            "name": name,
            "sourceId": source_id,
        });
        let response = self.request(Method::POST, "connections", Some(&body)).await?;
        response["connectionId"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Create-connection response missing connectionId"))
    }

    async fn update_connection(&self, external_connection_id: &str, catalog: &Value) -> Result<()> {
        let path = format!("connections/{}", external_connection_id);
        let body = json!({ "syncCatalog": catalog });
        self.request(Method::PATCH, &path, Some(&body)).await?;
        Ok(())
    }

    async fn trigger_sync(&self, external_connection_id: &str) -> Result<String> {
        let body = json!({
            "connectionId": external_connection_id,
            "jobType": "sync",
        });
        let response = self.request(Method::POST, "jobs", Some(&body)).await?;
        match &response["jobId"] {
            Value::String(id) => Ok(id.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(anyhow!("Trigger-sync response missing jobId")),
        }
    }

    async fn list_jobs(
        &self,
        external_connection_id: &str,
        limit: usize,
    ) -> Result<Vec<JobSummary>> {
        let path = format!(
            "jobs?connectionId={}&limit={}&orderBy=createdAt|DESC",
            external_connection_id, limit
        );
        let response = self.request(Method::GET, &path, None).await?;
        let jobs = response["data"]
            .as_array()
            .ok_or_else(|| anyhow!("List-jobs response missing data array"))?;

        let mut summaries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = match &job["jobId"] {
                Value::String(id) => id.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            let status = job["status"].as_str().unwrap_or("unknown").to_string();
            summaries.push(JobSummary { id, status });
        }
        Ok(summaries)
    }

    async fn get_job_logs(&self, job_id: &str) -> Result<String> {
        let path = format!("jobs/{}/logs", job_id);
        let response = self.request(Method::GET, &path, None).await?;
        match response {
            Value::String(text) => Ok(text),
            Value::Object(ref map) => Ok(map
                .get("logs")
                .and_then(|l| l.as_str())
                .unwrap_or_default()
                .to_string()),
            _ => Ok(String::new()),
        }
    }
}
