//! Input handlers
//!
//! Inputs are best-effort: lookup and payload errors are reported to the
//! caller, which drops them silently.

use crate::error::RuntimeError;
use crate::execution::parse_json_content;
use crate::memory::{EpisodicMemory, VectorStore, WorkingMemory};
use crate::models::{ContextState, InputEntry, LogEntry};
use crate::schema::Schema;
use crate::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputResponse {
    pub data: Value,
    pub params: Map<String, Value>,
}

pub struct InputContext<'a> {
    pub context: &'a ContextState,
    pub working_memory: &'a WorkingMemory,
}

#[async_trait::async_trait]
pub trait Input: Send + Sync {
    fn input_type(&self) -> &str;

    /// Content schema; plain string when absent
    fn schema(&self) -> Option<Schema> {
        None
    }

    async fn handle(&self, _data: &Value, _ctx: &InputContext<'_>) -> Result<Option<InputResponse>> {
        Ok(None)
    }

    fn format(&self, _entry: &InputEntry) -> Option<String> {
        None
    }
}

pub struct InputRegistry {
    inputs: HashMap<String, Arc<dyn Input>>,
    order: Vec<String>,
}

impl InputRegistry {
    pub fn new() -> Self {
        Self {
            inputs: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, input: Arc<dyn Input>) -> Result<()> {
        let input_type = input.input_type().to_string();
        if self.inputs.contains_key(&input_type) {
            return Err(RuntimeError::InvalidRegistry(format!(
                "duplicate input: {}",
                input_type
            )));
        }
        self.order.push(input_type.clone());
        self.inputs.insert(input_type, input);
        Ok(())
    }

    pub fn get(&self, input_type: &str) -> Option<Arc<dyn Input>> {
        self.inputs.get(input_type).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Input>> {
        self.order.iter().filter_map(|t| self.inputs.get(t))
    }

    pub fn list(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }
}

impl Default for InputRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_input_content(entry: &InputEntry, schema: Option<Schema>) -> Result<Value> {
    let schema = schema.unwrap_or(Schema::String);
    let raw = if schema.is_string() {
        Value::String(entry.content.clone())
    } else {
        parse_json_content(&entry.content)
            .map_err(|e| RuntimeError::parsing(LogEntry::Input(entry.clone()), e.to_string()))?
    };

    schema
        .validate(&raw)
        .map_err(|e| RuntimeError::parsing(LogEntry::Input(entry.clone()), e.to_string()))
}

/// Validate an input, recall related episodes and run its handler
pub async fn handle_input(
    registry: &InputRegistry,
    entry: &mut InputEntry,
    context: &ContextState,
    working_memory: &mut WorkingMemory,
    vector: &dyn VectorStore,
) -> Result<()> {
    let Some(input) = registry.get(&entry.input_type) else {
        return Err(RuntimeError::not_found(LogEntry::Input(entry.clone())));
    };

    let data = parse_input_content(entry, input.schema())?;

    debug!(context_id = %context.id, input_type = %entry.input_type, "Querying episodic memory");
    let episodes = vector.query(&context.id, &serde_json::to_string(&data)?).await?;
    trace!(context_id = %context.id, episodes = episodes.len(), "Episodic memory retrieved");
    working_memory.episodic_memory = Some(EpisodicMemory { episodes });

    let response = {
        let ctx = InputContext {
            context,
            working_memory: &*working_memory,
        };
        input.handle(&data, &ctx).await?
    };

    entry.data = Some(data);
    if let Some(response) = response {
        debug!(input_type = %entry.input_type, "Using custom input handler result");
        entry.data = Some(response.data);
        entry.params.extend(response.params);
    }

    entry.formatted = input.format(entry);
    entry.header.processed = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryVectorStore;
    use crate::models::EntryHeader;
    use serde_json::json;

    struct CliInput;

    #[async_trait::async_trait]
    impl Input for CliInput {
        fn input_type(&self) -> &str {
            "cli:message"
        }

        async fn handle(&self, data: &Value, _ctx: &InputContext<'_>) -> Result<Option<InputResponse>> {
            let mut params = Map::new();
            params.insert("user".to_string(), json!("trader"));
            Ok(Some(InputResponse {
                data: json!({ "text": data }),
                params,
            }))
        }

        fn format(&self, entry: &InputEntry) -> Option<String> {
            Some(format!("user: {}", entry.content))
        }
    }

    struct Structured;

    #[async_trait::async_trait]
    impl Input for Structured {
        fn input_type(&self) -> &str {
            "tick"
        }

        fn schema(&self) -> Option<Schema> {
            Some(Schema::object([("price", Schema::Number)]))
        }
    }

    fn registry() -> InputRegistry {
        let mut registry = InputRegistry::new();
        registry.register(Arc::new(CliInput)).unwrap();
        registry.register(Arc::new(Structured)).unwrap();
        registry
    }

    fn input(input_type: &str, content: &str) -> InputEntry {
        InputEntry {
            header: EntryHeader::committed(),
            input_type: input_type.to_string(),
            content: content.to_string(),
            data: None,
            params: Map::new(),
            formatted: None,
        }
    }

    #[tokio::test]
    async fn test_handler_and_episodes_applied() {
        let vector = InMemoryVectorStore::new();
        vector
            .upsert("cli:main", vec![json!({ "id": 1, "thought": "buy btc dip" })])
            .await
            .unwrap();

        let mut entry = input("cli:message", "btc");
        let mut memory = WorkingMemory::new();
        handle_input(
            &registry(),
            &mut entry,
            &ContextState::new("cli:main", "cli"),
            &mut memory,
            &vector,
        )
        .await
        .unwrap();

        assert_eq!(entry.data, Some(json!({ "text": "btc" })));
        assert_eq!(entry.params["user"], "trader");
        assert_eq!(entry.formatted.as_deref(), Some("user: btc"));
        assert_eq!(memory.episodic_memory.unwrap().episodes.len(), 1);
    }

    #[tokio::test]
    async fn test_structured_input_errors() {
        let vector = InMemoryVectorStore::new();
        let ctx = ContextState::new("cli:main", "cli");
        let mut memory = WorkingMemory::new();

        let mut ok = input("tick", r#"{"price": 101.5}"#);
        handle_input(&registry(), &mut ok, &ctx, &mut memory, &vector)
            .await
            .unwrap();
        assert_eq!(ok.data, Some(json!({ "price": 101.5 })));

        let mut bad = input("tick", "price is up");
        let err = handle_input(&registry(), &mut bad, &ctx, &mut memory, &vector)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Parsing { .. }));

        let mut unknown = input("email", "hi");
        let err = handle_input(&registry(), &mut unknown, &ctx, &mut memory, &vector)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound { .. }));
    }
}
