//! In-memory [`RecordStore`] implementation for tests and dry runs.
//!
//! Collections are `BTreeMap`s behind a single `std::sync::RwLock`, so
//! listing is naturally ordered by key like the SQLite backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::{merge_values, RecordStore, UpsertOutcome};

type Collections = HashMap<String, BTreeMap<String, Value>>;

pub struct InMemoryStore {
    collections: RwLock<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn upsert(&self, collection: &str, key: &str, value: Value) -> Result<UpsertOutcome> {
        let mut guard = self.collections.write().map_err(poisoned)?;
        let records = guard.entry(collection.to_string()).or_default();
        match records.remove(key) {
            Some(existing) => {
                records.insert(key.to_string(), merge_values(existing, value));
                Ok(UpsertOutcome::Updated)
            }
            None => {
                records.insert(key.to_string(), value);
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let guard = self.collections.read().map_err(poisoned)?;
        Ok(guard.get(collection).and_then(|c| c.get(key)).cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let guard = self.collections.read().map_err(poisoned)?;
        Ok(guard
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let guard = self.collections.read().map_err(poisoned)?;
        Ok(guard.get(collection).map(|c| c.len()).unwrap_or(0))
    }
}
