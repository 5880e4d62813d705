//! Repair knowledge store — the feedback half of the healing loop.
//!
//! Every successful repair is appended here together with its error
//! signature, and [`KnowledgeStore`] doubles as the default
//! [`SimilarityIndex`]: future drift events retrieve the most similar
//! past repairs as few-shot context for the generator. With embeddings
//! enabled, similarity is cosine distance over signature vectors; when
//! disabled, retrieval degrades to the most recent records.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::EmbeddingConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_signature, vec_to_blob};
use crate::models::{RepairKnowledgeRecord, SimilarRepair};

/// Retrieval of historical repairs by similarity to an error signature.
///
/// The production implementation is the local [`KnowledgeStore`]; a
/// deployment can substitute a remote index behind the same trait.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn find_similar(&self, error_signature: &str, top_k: usize)
        -> Result<Vec<SimilarRepair>>;
}

pub struct KnowledgeStore {
    pool: SqlitePool,
    embedding: EmbeddingConfig,
}

impl KnowledgeStore {
    pub fn new(pool: SqlitePool, embedding: EmbeddingConfig) -> Self {
        Self { pool, embedding }
    }

    /// Append one confirmed repair. The signature embedding is best-effort:
    /// an embedding failure stores the record without a vector.
    pub async fn append(
        &self,
        source_type: &str,
        error_signature: &str,
        catalog: &Value,
        confidence: f64,
    ) -> Result<RepairKnowledgeRecord> {
        let embedding_blob = if self.embedding.is_enabled() {
            match embed_signature(&self.embedding, error_signature).await {
                Ok(vector) => Some(vec_to_blob(&vector)),
                Err(e) => {
                    tracing::warn!(error = %e, "could not embed error signature, storing without vector");
                    None
                }
            }
        } else {
            None
        };

        let record = RepairKnowledgeRecord {
            id: Uuid::new_v4().to_string(),
            source_type: source_type.to_string(),
            error_signature: error_signature.to_string(),
            catalog: catalog.clone(),
            confidence,
            created_at: Utc::now().timestamp(),
        };

        let mut hasher = Sha256::new();
        hasher.update(error_signature.as_bytes());
        let fingerprint = format!("{:x}", hasher.finalize());

        sqlx::query(
            r#"
            INSERT INTO repair_knowledge (id, source_type, error_signature, signature_fingerprint, signature_embedding, catalog_json, confidence, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.source_type)
        .bind(&record.error_signature)
        .bind(&fingerprint)
        .bind(&embedding_blob)
        .bind(serde_json::to_string(&record.catalog)?)
        .bind(record.confidence)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM repair_knowledge")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn load_all(&self) -> Result<Vec<(SimilarRepair, Option<Vec<f32>>)>> {
        let rows = sqlx::query(
            "SELECT source_type, error_signature, signature_embedding, catalog_json, confidence FROM repair_knowledge ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut repairs = Vec::with_capacity(rows.len());
        for row in &rows {
            let catalog_json: String = row.try_get("catalog_json")?;
            let embedding: Option<Vec<u8>> = row.try_get("signature_embedding")?;
            repairs.push((
                SimilarRepair {
                    source_type: row.try_get("source_type")?,
                    error_signature: row.try_get("error_signature")?,
                    successful_catalog: serde_json::from_str(&catalog_json)?,
                    confidence: row.try_get("confidence")?,
                },
                embedding.map(|blob| blob_to_vec(&blob)),
            ));
        }
        Ok(repairs)
    }
}

/// Rank repairs by cosine similarity to the query vector. Records without
/// an embedding are skipped; input order breaks ties.
fn rank_by_similarity(
    query: &[f32],
    repairs: Vec<(SimilarRepair, Option<Vec<f32>>)>,
    top_k: usize,
) -> Vec<SimilarRepair> {
    let mut scored: Vec<(f32, SimilarRepair)> = repairs
        .into_iter()
        .filter_map(|(repair, embedding)| {
            embedding.map(|vector| (cosine_similarity(query, &vector), repair))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(top_k)
        .map(|(_, repair)| repair)
        .collect()
}

#[async_trait]
impl SimilarityIndex for KnowledgeStore {
    async fn find_similar(
        &self,
        error_signature: &str,
        top_k: usize,
    ) -> Result<Vec<SimilarRepair>> {
        let repairs = self.load_all().await?;
        if repairs.is_empty() {
            return Ok(Vec::new());
        }

        if self.embedding.is_enabled() {
            match embed_signature(&self.embedding, error_signature).await {
                Ok(query) => return Ok(rank_by_similarity(&query, repairs, top_k)),
                Err(e) => {
                    tracing::warn!(error = %e, "query embedding failed, falling back to recency");
                }
            }
        }

        // Recency fallback: load_all is already newest-first.
        Ok(repairs
            .into_iter()
            .take(top_k)
            .map(|(repair, _)| repair)
            .collect())
    }
}
