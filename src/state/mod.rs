//! Key-value memory persistence
//!
//! Backs working-memory snapshots and action-scoped memory slices.
//! Currently in-memory; swap the store for a durable backend.

use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for memory persistence
#[async_trait::async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store for development and tests
pub struct InMemoryMemoryStore {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        let values = self.values.read().await;
        let mut keys: Vec<String> = values.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let values = self.values.read().await;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.write().await;
        values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().await;
        values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryMemoryStore::new();
        assert_eq!(store.get("orders").await.unwrap(), None);

        store.set("orders", json!({ "open": 2 })).await.unwrap();
        assert_eq!(store.get("orders").await.unwrap(), Some(json!({ "open": 2 })));
        assert_eq!(store.keys().await, vec!["orders".to_string()]);

        store.delete("orders").await.unwrap();
        assert_eq!(store.get("orders").await.unwrap(), None);
    }
}
