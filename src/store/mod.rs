//! Keyed record storage for docqa.
//!
//! The [`RecordStore`] trait is the only persistence seam the pipeline
//! depends on. Records are JSON objects grouped into named collections
//! ([`EVENTS`](crate::models::EVENTS), [`DOCUMENTS`](crate::models::DOCUMENTS),
//! [`DATASET`](crate::models::DATASET)) and addressed by a string key.
//!
//! Writes are idempotent upserts: an absent key is created, a present key
//! has the new top-level fields merged over the stored object. Fields the
//! new value does not mention are kept, which lets document metadata and
//! the later page list be written separately.
//!
//! Implementations must be `Send + Sync` to be shared across the page
//! fan-out tasks.

pub mod memory;
pub mod sqlite;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Whether an upsert inserted a new record or touched an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Abstract record store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](RecordStore::upsert) | Create or shallow-merge a record |
/// | [`get`](RecordStore::get) | Fetch one record |
/// | [`list`](RecordStore::list) | All records in a collection, ordered by key |
/// | [`count`](RecordStore::count) | Number of records in a collection |
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, collection: &str, key: &str, value: Value) -> Result<UpsertOutcome>;

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Shallow merge: top-level fields of `update` replace those of `existing`.
///
/// A non-object on either side replaces the stored value wholesale.
pub fn merge_values(existing: Value, update: Value) -> Value {
    match (existing, update) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (field, value) in patch {
                base.insert(field, value);
            }
            Value::Object(base)
        }
        (_, update) => update,
    }
}

/// Typed convenience layer over any [`RecordStore`].
#[async_trait]
pub trait RecordStoreExt: RecordStore {
    async fn put<T: Serialize + Sync>(
        &self,
        collection: &str,
        key: &str,
        value: &T,
    ) -> Result<UpsertOutcome> {
        let json = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize {}/{}", collection, key))?;
        self.upsert(collection, key, json).await
    }

    async fn fetch<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>> {
        match self.get(collection, key).await? {
            Some(value) => {
                let typed = serde_json::from_value(value)
                    .with_context(|| format!("Malformed record {}/{}", collection, key))?;
                Ok(Some(typed))
            }
            None => Ok(None),
        }
    }

    async fn fetch_all<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        for (key, value) in self.list(collection).await? {
            let typed = serde_json::from_value(value)
                .with_context(|| format!("Malformed record {}/{}", collection, key))?;
            out.push((key, typed));
        }
        Ok(out)
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}
