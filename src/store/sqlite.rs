//! SQLite-backed [`RecordStore`] implementation.
//!
//! Every collection lives in the single `records` table, keyed by
//! `(collection, key)`, with the value stored as JSON text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use super::{merge_values, RecordStore, UpsertOutcome};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn upsert(&self, collection: &str, key: &str, value: Value) -> Result<UpsertOutcome> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Take the write lock before reading. A read-then-write transaction
        // in WAL mode fails with SQLITE_BUSY if another writer commits in
        // between, instead of waiting on busy_timeout.
        sqlx::query("UPDATE records SET updated_at = updated_at WHERE collection = ? AND key = ?")
            .bind(collection)
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT value_json FROM records WHERE collection = ? AND key = ?")
                .bind(collection)
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match existing {
            Some(raw) => {
                let stored: Value = serde_json::from_str(&raw)
                    .with_context(|| format!("Malformed record {}/{}", collection, key))?;
                let merged = serde_json::to_string(&merge_values(stored, value))?;
                sqlx::query(
                    "UPDATE records SET value_json = ?, updated_at = ? WHERE collection = ? AND key = ?",
                )
                .bind(merged)
                .bind(now)
                .bind(collection)
                .bind(key)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Updated
            }
            None => {
                // A concurrent writer may have inserted the key since the
                // SELECT; fold into its row rather than failing.
                sqlx::query(
                    r#"
                    INSERT INTO records (collection, key, value_json, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(collection, key) DO UPDATE SET
                        value_json = excluded.value_json,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(collection)
                .bind(key)
                .bind(serde_json::to_string(&value)?)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Created
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value_json FROM records WHERE collection = ? AND key = ?")
                .bind(collection)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        raw.map(|r| {
            serde_json::from_str(&r)
                .with_context(|| format!("Malformed record {}/{}", collection, key))
        })
        .transpose()
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query(
            "SELECT key, value_json FROM records WHERE collection = ? ORDER BY key ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let raw: String = row.get("value_json");
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed record {}/{}", collection, key))?;
            out.push((key, value));
        }
        Ok(out)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
