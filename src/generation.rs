//! Client boundary for the catalog generation service.
//!
//! Given a failure signature, the last-known-good catalog, and a handful
//! of historical repairs as few-shot context, the service proposes a
//! corrected catalog. Its output is untrusted: everything goes through
//! [`validate_catalog`] before the proposer will publish it.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::models::SimilarRepair;

/// Inputs to one generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub error_signature: String,
    pub last_good_catalog: Value,
    /// Up to a few historical repairs, most similar first.
    pub historical_repairs: Vec<SimilarRepair>,
}

/// Produces a candidate catalog document for a drift repair.
#[async_trait]
pub trait CatalogGenerator: Send + Sync {
    async fn propose(&self, request: &GenerationRequest) -> Result<Value>;
}

/// Validate untrusted generator output as a catalog document.
///
/// A catalog must be a JSON object with a non-empty `streams` array.
/// Anything else is "no proposal" and routes the connection to manual
/// review.
pub fn validate_catalog(value: &Value) -> Result<Value> {
    let streams = value
        .get("streams")
        .ok_or_else(|| anyhow!("Proposed catalog has no streams field"))?;
    let streams = streams
        .as_array()
        .ok_or_else(|| anyhow!("Proposed catalog streams is not an array"))?;
    if streams.is_empty() {
        bail!("Proposed catalog has no streams");
    }
    Ok(value.clone())
}

/// Extract a JSON document from model output that may be wrapped in
/// markdown code fences or surrounding prose.
pub fn extract_json_document(text: &str) -> Result<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    // Fenced block, e.g. ```json ... ```
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let after_lang = after_fence
            .split_once('\n')
            .map(|(_, rest)| rest)
            .unwrap_or(after_fence);
        if let Some(end) = after_lang.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after_lang[..end].trim()) {
                return Ok(value);
            }
        }
    }

    // Last resort: the outermost brace span.
    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[open..=close]) {
                return Ok(value);
            }
        }
    }

    bail!("Generator output is not parseable JSON")
}

/// Chat-completions client for the generation service.
pub struct HttpGenerator {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn build_prompt(request: &GenerationRequest) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "A data sync failed because the source schema changed. \
             Produce a corrected sync catalog as a single JSON object with a \"streams\" array. \
             Respond with JSON only.\n\n",
        );
        prompt.push_str(&format!("Failure signature:\n{}\n\n", request.error_signature));
        prompt.push_str(&format!(
            "Last known good catalog:\n{}\n",
            request.last_good_catalog
        ));

        if !request.historical_repairs.is_empty() {
            prompt.push_str("\nPrevious successful repairs for similar failures:\n");
            for repair in &request.historical_repairs {
                prompt.push_str(&format!(
                    "- failure: {}\n  repaired catalog: {}\n",
                    repair.error_signature, repair.successful_catalog
                ));
            }
        }
        prompt
    }
}

#[async_trait]
impl CatalogGenerator for HttpGenerator {
    async fn propose(&self, request: &GenerationRequest) -> Result<Value> {
        let api_key = std::env::var(&self.config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", self.config.api_key_env))?;

        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "user", "content": Self::build_prompt(request) }
            ],
            "temperature": 0.0,
        });

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await?;
                        let content = json["choices"][0]["message"]["content"]
                            .as_str()
                            .ok_or_else(|| anyhow!("Generation response missing content"))?;
                        return extract_json_document(content);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("Generation service error {}: {}", status, text));
                        continue;
                    }

                    let text = response.text().await.unwrap_or_default();
                    bail!("Generation service error {}: {}", status, text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Generation failed after retries")))
    }
}
