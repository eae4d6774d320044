//! Episodic vector memory
//!
//! Episodes pair the reasoning that led to an action with the call and its
//! result. They are written when a result commits and recalled for each input.

use crate::models::{ActionCall, ActionResult, Thought};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Number of episodes returned per query
const DEFAULT_TOP_K: usize = 5;

#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, context_id: &str, documents: Vec<Value>) -> Result<()>;
    async fn query(&self, context_id: &str, query: &str) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    pub id: Uuid,
    pub thought: String,
    pub action: String,
    pub call: Value,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

impl Episode {
    pub fn new(thought: &Thought, call: &ActionCall, result: &ActionResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            thought: thought.content.clone(),
            action: call.name.clone(),
            call: call
                .data
                .clone()
                .unwrap_or_else(|| Value::String(call.content.clone())),
            result: result.data.clone(),
            timestamp: Utc::now(),
        }
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Term-overlap ranked store for development and tests
pub struct InMemoryVectorStore {
    documents: Arc<RwLock<HashMap<String, Vec<Value>>>>,
    top_k: usize,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            top_k: DEFAULT_TOP_K,
        }
    }

    pub async fn count(&self, context_id: &str) -> usize {
        let documents = self.documents.read().await;
        documents.get(context_id).map(Vec::len).unwrap_or(0)
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, context_id: &str, documents: Vec<Value>) -> Result<()> {
        let mut stored = self.documents.write().await;
        let bucket = stored.entry(context_id.to_string()).or_default();

        for doc in documents {
            let existing = doc
                .get("id")
                .and_then(|id| bucket.iter().position(|d| d.get("id") == Some(id)));
            match existing {
                Some(i) => bucket[i] = doc,
                None => bucket.push(doc),
            }
        }
        Ok(())
    }

    async fn query(&self, context_id: &str, query: &str) -> Result<Vec<Value>> {
        let stored = self.documents.read().await;
        let Some(bucket) = stored.get(context_id) else {
            return Ok(Vec::new());
        };

        let wanted = tokens(query);
        let mut scored: Vec<(usize, usize, &Value)> = bucket
            .iter()
            .enumerate()
            .map(|(i, doc)| (tokens(&doc.to_string()).intersection(&wanted).count(), i, doc))
            .filter(|(score, _, _)| *score > 0)
            .collect();

        // Highest overlap first, newest first on ties
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        Ok(scored
            .into_iter()
            .take(self.top_k)
            .map(|(_, _, doc)| doc.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_ranks_by_overlap_and_scopes_by_context() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "ctx-1",
                vec![
                    json!({ "id": "a", "thought": "check btc order book" }),
                    json!({ "id": "b", "thought": "eth funding rate" }),
                ],
            )
            .await
            .unwrap();

        let hits = store.query("ctx-1", "BTC order").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "a");

        assert!(store.query("ctx-2", "btc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = InMemoryVectorStore::new();
        store.upsert("c", vec![json!({ "id": 1, "v": "old" })]).await.unwrap();
        store.upsert("c", vec![json!({ "id": 1, "v": "new" })]).await.unwrap();

        assert_eq!(store.count("c").await, 1);
        assert_eq!(store.query("c", "new").await.unwrap()[0]["v"], "new");
    }
}
