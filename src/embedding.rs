//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete HTTP providers:
//! - **[`OpenAiEmbedder`]**: `POST {endpoint}/v1/embeddings`.
//! - **[`GeminiEmbedder`]**: `POST {endpoint}/v1beta/models/{model}:batchEmbedContents`.
//!
//! `embedding.provider = "disabled"` yields no embedder at all and the
//! pipeline skips the indexing branch.
//!
//! Also provides vector utilities used by the SQLite vector index:
//! - [`cosine_similarity`]
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//!
//! # Batching and retry
//!
//! [`embed_texts`] splits its input into batches of `embedding.batch_size`
//! (default 5) and sends one request per batch. Each request goes through
//! the shared [`RetryPolicy`]: 429 and 5xx are retried with exponential
//! backoff, other 4xx fail immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::EmbeddingConfig;
use crate::error::{self, ServiceError};
use crate::retry::RetryPolicy;

const SERVICE: &str = "embedding";

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Maximum texts per request.
    fn batch_size(&self) -> usize;

    /// Embed one batch; vectors are returned in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed any number of texts, one request per batch.
pub async fn embed_texts(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(embedder.batch_size().max(1)) {
        let vectors = embedder.embed_batch(batch).await?;
        if vectors.len() != batch.len() {
            bail!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            );
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embed_texts(embedder, &[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Create the configured embedder; `None` when embeddings are disabled.
///
/// | Config Value | Provider | Key |
/// |-------------|----------|-----|
/// | `"disabled"` | none | |
/// | `"openai"` | [`OpenAiEmbedder`] | `OPENAI_API_KEY` |
/// | `"gemini"` | [`GeminiEmbedder`] | `GEMINI_API_KEY` |
pub fn from_config(
    config: &EmbeddingConfig,
    retry: RetryPolicy,
) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => {
            let key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY environment variable not set")?;
            Ok(Some(Arc::new(OpenAiEmbedder::new(config, key, retry)?)))
        }
        "gemini" => {
            let key = std::env::var("GEMINI_API_KEY")
                .context("GEMINI_API_KEY environment variable not set")?;
            Ok(Some(Arc::new(GeminiEmbedder::new(config, key, retry)?)))
        }
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn required_model(config: &EmbeddingConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {}", config.provider))
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn parse_vector(values: &Value) -> Option<Vec<f32>> {
    values
        .as_array()
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ============ OpenAI ============

pub struct OpenAiEmbedder {
    endpoint: String,
    model: String,
    dims: Option<usize>,
    batch_size: usize,
    api_key: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: required_model(config)?,
            dims: config.dims,
            batch_size: config.batch_size,
            api_key,
            client: http_client(config)?,
            retry,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.endpoint);
        let mut body = json!({"model": self.model, "input": texts});
        if let Some(dims) = self.dims {
            body["dimensions"] = json!(dims);
        }
        self.retry
            .run("embedding.openai", || async {
                let req = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&body);
                let resp = error::send_checked(SERVICE, req).await?;
                let json = error::read_json(SERVICE, resp).await?;
                Ok::<_, anyhow::Error>(parse_openai_response(&json)?)
            })
            .await
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, ServiceError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ServiceError::parse(SERVICE, "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vec = item
            .get("embedding")
            .and_then(parse_vector)
            .ok_or_else(|| ServiceError::parse(SERVICE, "missing embedding"))?;
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Gemini ============

pub struct GeminiEmbedder {
    endpoint: String,
    model: String,
    dims: Option<usize>,
    batch_size: usize,
    api_key: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl GeminiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: required_model(config)?,
            dims: config.dims,
            batch_size: config.batch_size,
            api_key,
            client: http_client(config)?,
            retry,
        })
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents",
            self.endpoint, self.model
        );
        let requests: Vec<Value> = texts
            .iter()
            .map(|t| {
                let mut r = json!({
                    "model": format!("models/{}", self.model),
                    "content": {"parts": [{"text": t}]},
                });
                if let Some(dims) = self.dims {
                    r["outputDimensionality"] = json!(dims);
                }
                r
            })
            .collect();
        let body = json!({"requests": requests});

        self.retry
            .run("embedding.gemini", || async {
                let req = self
                    .client
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(&body);
                let resp = error::send_checked(SERVICE, req).await?;
                let json = error::read_json(SERVICE, resp).await?;
                Ok::<_, anyhow::Error>(parse_gemini_response(&json)?)
            })
            .await
    }
}

fn parse_gemini_response(json: &Value) -> Result<Vec<Vec<f32>>, ServiceError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ServiceError::parse(SERVICE, "missing embeddings array"))?
        .iter()
        .map(|item| {
            item.get("values")
                .and_then(parse_vector)
                .ok_or_else(|| ServiceError::parse(SERVICE, "missing embedding values"))
        })
        .collect()
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use docqa::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
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

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
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
    use std::sync::Mutex;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_openai_response_sorted_by_index() {
        let json = json!({"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]},
        ]});
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_gemini_response() {
        let json = json!({"embeddings": [{"values": [0.5, 0.25]}]});
        assert_eq!(parse_gemini_response(&json).unwrap(), vec![vec![0.5, 0.25]]);
        assert!(parse_gemini_response(&json!({})).is_err());
    }

    struct CountingEmbedder {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn batch_size(&self) -> usize {
            5
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batches.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    #[tokio::test]
    async fn test_embed_texts_batches_by_five() {
        let embedder = CountingEmbedder {
            batches: Mutex::new(Vec::new()),
        };
        let texts: Vec<String> = (0..12).map(|i| "x".repeat(i)).collect();
        let vecs = embed_texts(&embedder, &texts).await.unwrap();
        assert_eq!(vecs.len(), 12);
        assert_eq!(vecs[11], vec![11.0]);
        assert_eq!(*embedder.batches.lock().unwrap(), vec![5, 5, 2]);
    }
}
