//! Embedding provider abstraction with caching.
//!
//! Providers:
//! - **disabled** — returns empty vectors; retrieval then falls back to
//!   structural + lexical scoring only.
//! - **openai** — `POST {url}/embeddings` with batching, retry, backoff.
//! - **ollama** — `POST {url}/api/embed` against a local instance.
//!
//! Results are cached per `sha256(text)` and provider tag: a process-local
//! read-dominant map backed by the `embedding_cache` side table, so repeated
//! ingests and restarts do not re-pay provider calls.
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, max 3
//! retries); other 4xx → fail immediately; network errors → retry. On final
//! failure the batch resolves to empty vectors and callers record
//! `embedding_status=failed` on the affected nodes.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::config::EmbeddingConfig;
use crate::error::{GraphLoomError, Result};

pub struct Embedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
    pool: SqlitePool,
    memory: RwLock<HashMap<String, Vec<f32>>>,
}

impl Embedder {
    pub fn new(config: EmbeddingConfig, pool: SqlitePool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            pool,
            memory: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Provider tag stored alongside cached vectors, e.g.
    /// `openai:text-embedding-3-small`.
    pub fn provider_tag(&self) -> String {
        format!(
            "{}:{}",
            self.config.provider,
            self.config.model.as_deref().unwrap_or("none")
        )
    }

    /// Embed a batch of texts, aligned with the input order. Disabled
    /// provider yields empty vectors; a provider failure after retries is
    /// an error the caller degrades from.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if !self.is_enabled() || texts.is_empty() {
            return Ok(vec![Vec::new(); texts.len()]);
        }

        let tag = self.provider_tag();
        let hashes: Vec<String> = texts.iter().map(|t| text_hash(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        {
            let memory = self.memory.read().unwrap();
            for (i, hash) in hashes.iter().enumerate() {
                if let Some(vec) = memory.get(hash) {
                    out[i] = Some(vec.clone());
                }
            }
        }

        for (i, hash) in hashes.iter().enumerate() {
            if out[i].is_some() {
                continue;
            }
            if let Some(vec) = self.load_cached(hash, &tag).await? {
                self.memory.write().unwrap().insert(hash.clone(), vec.clone());
                out[i] = Some(vec);
            }
        }

        let missing: Vec<usize> = (0..texts.len()).filter(|i| out[*i].is_none()).collect();
        if !missing.is_empty() {
            for batch in missing.chunks(self.config.batch_size.max(1)) {
                let batch_texts: Vec<String> =
                    batch.iter().map(|&i| texts[i].clone()).collect();
                let vectors = self.call_provider(&batch_texts).await?;
                if vectors.len() != batch_texts.len() {
                    return Err(GraphLoomError::ProviderFailure(format!(
                        "provider returned {} vectors for {} inputs",
                        vectors.len(),
                        batch_texts.len()
                    )));
                }
                for (&i, vec) in batch.iter().zip(vectors.into_iter()) {
                    self.store_cached(&hashes[i], &tag, &vec).await?;
                    self.memory
                        .write()
                        .unwrap()
                        .insert(hashes[i].clone(), vec.clone());
                    out[i] = Some(vec);
                }
            }
        }

        Ok(out.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(&[text.to_string()]).await?;
        Ok(vectors.pop().unwrap_or_default())
    }

    async fn load_cached(&self, hash: &str, tag: &str) -> Result<Option<Vec<f32>>> {
        let row =
            sqlx::query("SELECT vector FROM embedding_cache WHERE hash = ? AND provider = ?")
                .bind(hash)
                .bind(tag)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| {
            let blob: Vec<u8> = r.get("vector");
            blob_to_vec(&blob)
        }))
    }

    async fn store_cached(&self, hash: &str, tag: &str, vector: &[f32]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (hash, provider, vector) VALUES (?, ?, ?)
            ON CONFLICT(hash, provider) DO UPDATE SET vector = excluded.vector
            "#,
        )
        .bind(hash)
        .bind(tag)
        .bind(vec_to_blob(vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn call_provider(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self.config.provider.as_str() {
            "openai" => self.embed_openai(texts).await,
            "ollama" => self.embed_ollama(texts).await,
            other => Err(GraphLoomError::ProviderFailure(format!(
                "unknown embedding provider: {}",
                other
            ))),
        }
    }

    async fn embed_openai(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = self
            .config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                GraphLoomError::ProviderFailure("OPENAI_API_KEY not set".to_string())
            })?;
        let model = self.config.model.as_deref().unwrap_or("text-embedding-3-small");
        let url = format!(
            "{}/embeddings",
            self.config
                .url
                .as_deref()
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
        );
        let body = serde_json::json!({ "model": model, "input": texts });

        let json = self
            .request_with_retry(|client| {
                client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", api_key))
                    .header("Content-Type", "application/json")
                    .json(&body)
            })
            .await?;
        parse_openai_response(&json)
    }

    async fn embed_ollama(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.config.model.as_deref().unwrap_or("nomic-embed-text");
        let url = format!(
            "{}/api/embed",
            self.config
                .url
                .as_deref()
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
        );
        let body = serde_json::json!({ "model": model, "input": texts });

        let json = self
            .request_with_retry(|client| {
                client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .json(&body)
            })
            .await?;
        parse_ollama_response(&json)
    }

    async fn request_with_retry(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<serde_json::Value> {
        let mut last_err: Option<GraphLoomError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match build(&self.client).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| GraphLoomError::ProviderFailure(e.to_string()));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(GraphLoomError::Transient(format!(
                            "embedding API error {}: {}",
                            status, text
                        )));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(GraphLoomError::ProviderFailure(format!(
                        "embedding API error {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(GraphLoomError::Transient(e.to_string()));
                    continue;
                }
            }
        }

        Err(match last_err {
            Some(GraphLoomError::Transient(msg)) => GraphLoomError::ProviderFailure(msg),
            Some(other) => other,
            None => GraphLoomError::ProviderFailure("embedding failed after retries".to_string()),
        })
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        GraphLoomError::ProviderFailure("invalid embedding response: missing data".to_string())
    })?;
    let mut out = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                GraphLoomError::ProviderFailure(
                    "invalid embedding response: missing embedding".to_string(),
                )
            })?;
        out.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(out)
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            GraphLoomError::ProviderFailure(
                "invalid embedding response: missing embeddings".to_string(),
            )
        })?;
    let mut out = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| {
                GraphLoomError::ProviderFailure(
                    "invalid embedding response: embedding is not an array".to_string(),
                )
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        out.push(vec);
    }
    Ok(out)
}

/// SHA-256 hex digest used as the embedding cache key.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_text_hash_is_stable() {
        assert_eq!(text_hash("abc"), text_hash("abc"));
        assert_ne!(text_hash("abc"), text_hash("abd"));
    }

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE embedding_cache (hash TEXT NOT NULL, provider TEXT NOT NULL, vector BLOB NOT NULL, PRIMARY KEY (hash, provider))",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_disabled_provider_returns_empties() {
        let pool = test_pool().await;
        let embedder = Embedder::new(EmbeddingConfig::default(), pool);
        assert!(!embedder.is_enabled());
        let out = embedder
            .embed_texts(&["one".to_string(), "two".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|v| v.is_empty()));
    }

    #[tokio::test]
    async fn test_cache_side_table_roundtrip() {
        let pool = test_pool().await;
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            model: Some("test-model".to_string()),
            ..Default::default()
        };
        let embedder = Embedder::new(config, pool);
        let tag = embedder.provider_tag();
        let hash = text_hash("cached text");
        embedder
            .store_cached(&hash, &tag, &[0.25, -0.5])
            .await
            .unwrap();
        // A hit from the side table avoids any provider call.
        let out = embedder
            .embed_texts(&["cached text".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![0.25, -0.5]]);
    }
}
