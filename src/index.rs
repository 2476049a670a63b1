//! Vector index for page embeddings.
//!
//! Points are keyed `{filename}:{page_number}` (see
//! [`page_id`](crate::models::page_id)) so re-processing a document
//! overwrites its previous vectors.
//!
//! - [`SqliteVectorIndex`]: vectors stored as BLOBs in `page_vectors`;
//!   queries compute cosine similarity in Rust over every row.
//! - [`VertexIndex`]: `POST {endpoint}/v1/{index}:upsertDatapoints`, bearer
//!   token from `DOCQA_VECTOR_TOKEN`. Querying happens on the remote side.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::config::VectorIndexConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexPoint {
    pub id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, points: &[IndexPoint]) -> Result<()>;
}

pub fn from_config(
    config: &VectorIndexConfig,
    pool: SqlitePool,
    retry: RetryPolicy,
) -> Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "sqlite" => Ok(Arc::new(SqliteVectorIndex::new(pool))),
        "vertex" => Ok(Arc::new(VertexIndex::from_config(config, retry)?)),
        other => bail!("Unknown vector index provider: '{}'", other),
    }
}

// ============ SQLite ============

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Top `k` points by cosine similarity to `vector`, best first.
    pub async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexMatch>> {
        let rows = sqlx::query("SELECT id, embedding FROM page_vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut matches: Vec<IndexMatch> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                IndexMatch {
                    id: row.get("id"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(k);
        Ok(matches)
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM page_vectors")
            .fetch_one(&self.pool)
            .await?)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, points: &[IndexPoint]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for point in points {
            sqlx::query(
                r#"
                INSERT INTO page_vectors (id, dims, embedding, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&point.id)
            .bind(point.vector.len() as i64)
            .bind(vec_to_blob(&point.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ============ Vertex ============

const SERVICE: &str = "vector_index";

pub struct VertexIndex {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl VertexIndex {
    pub fn from_config(config: &VectorIndexConfig, retry: RetryPolicy) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .context("vector_index.endpoint required for vertex")?;
        let index = config
            .index
            .as_deref()
            .context("vector_index.index required for vertex")?;
        Ok(Self::new(
            endpoint,
            index,
            std::env::var("DOCQA_VECTOR_TOKEN").ok(),
            retry,
        ))
    }

    pub fn new(endpoint: &str, index: &str, token: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            url: format!(
                "{}/v1/{}:upsertDatapoints",
                endpoint.trim_end_matches('/'),
                index
            ),
            token,
            client: reqwest::Client::new(),
            retry,
        }
    }
}

#[async_trait]
impl VectorIndex for VertexIndex {
    async fn upsert(&self, points: &[IndexPoint]) -> Result<()> {
        let datapoints: Vec<_> = points
            .iter()
            .map(|p| json!({"datapointId": p.id, "featureVector": p.vector}))
            .collect();
        let body = json!({"datapoints": datapoints});

        self.retry
            .run("vector_index.upsert", || async {
                let mut req = self.client.post(&self.url).json(&body);
                if let Some(ref token) = self.token {
                    req = req.bearer_auth(token);
                }
                error::send_checked(SERVICE, req).await?;
                Ok::<_, anyhow::Error>(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn index() -> SqliteVectorIndex {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();
        SqliteVectorIndex::new(pool)
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_id() {
        let idx = index().await;
        let p = |id: &str, v: Vec<f32>| IndexPoint {
            id: id.to_string(),
            vector: v,
        };
        idx.upsert(&[p("a.pdf:0", vec![1.0, 0.0]), p("a.pdf:1", vec![0.0, 1.0])])
            .await
            .unwrap();
        idx.upsert(&[p("a.pdf:0", vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(idx.count().await.unwrap(), 2);

        let top = idx.query(&[0.0, 1.0], 5).await.unwrap();
        assert_eq!(top.len(), 2);
        assert!((top[0].score - 1.0).abs() < 1e-6);
        assert!((top[1].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_query_orders_by_similarity() {
        let idx = index().await;
        idx.upsert(&[
            IndexPoint {
                id: "far".into(),
                vector: vec![-1.0, 0.0],
            },
            IndexPoint {
                id: "near".into(),
                vector: vec![1.0, 0.1],
            },
        ])
        .await
        .unwrap();
        let top = idx.query(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id, "near");
    }
}
