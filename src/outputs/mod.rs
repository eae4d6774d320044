//! Output handlers
//!
//! Outputs tolerate malformed payloads: empty content, leaked tag markup and
//! invalid JSON all fall back to the schema's empty payload before validation.

use crate::error::RuntimeError;
use crate::execution::parse_json_content;
use crate::memory::WorkingMemory;
use crate::models::{ContextState, LogEntry, OutputEntry};
use crate::schema::Schema;
use crate::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fields a handler wants to set on the committed output entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputResponse {
    pub data: Option<Value>,
    pub params: Map<String, Value>,
    pub processed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputReply {
    /// Commit the entry as parsed
    Unchanged,
    /// Merge into the entry, keeping its id
    Single(OutputResponse),
    /// Commit one entry per response, each with a fresh id
    FanOut(Vec<OutputResponse>),
}

pub struct OutputContext<'a> {
    pub context: &'a ContextState,
    pub working_memory: &'a WorkingMemory,
    pub entry: &'a OutputEntry,
}

#[async_trait::async_trait]
pub trait Output: Send + Sync {
    fn output_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn schema(&self) -> Option<Schema> {
        None
    }

    fn enabled(&self, _context: &ContextState, _working_memory: &WorkingMemory) -> bool {
        true
    }

    async fn handle(&self, _data: &Value, _ctx: &OutputContext<'_>) -> Result<OutputReply> {
        Ok(OutputReply::Unchanged)
    }

    fn format(&self, _data: &Value) -> Option<String> {
        None
    }
}

pub struct OutputRegistry {
    outputs: HashMap<String, Arc<dyn Output>>,
    order: Vec<String>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, output: Arc<dyn Output>) -> Result<()> {
        let output_type = output.output_type().to_string();
        if self.outputs.contains_key(&output_type) {
            return Err(RuntimeError::InvalidRegistry(format!(
                "duplicate output: {}",
                output_type
            )));
        }
        self.order.push(output_type.clone());
        self.outputs.insert(output_type, output);
        Ok(())
    }

    pub fn get(&self, output_type: &str) -> Option<Arc<dyn Output>> {
        self.outputs.get(output_type).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Output>> {
        self.order.iter().filter_map(|t| self.outputs.get(t))
    }

    pub fn list(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }
}

impl Default for OutputRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Outputs whose `enabled` predicate admits this context
pub fn prepare_outputs(
    registry: &OutputRegistry,
    context: &ContextState,
    working_memory: &WorkingMemory,
) -> Vec<Arc<dyn Output>> {
    registry
        .iter()
        .filter(|o| o.enabled(context, working_memory))
        .cloned()
        .collect()
}

/// Content that opens with one of the recognized tags rather than JSON
fn looks_like_leaked_markup(content: &str, tags: &[&str]) -> bool {
    let Some(rest) = content.strip_prefix('<') else {
        return false;
    };
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    tags.iter().any(|tag| {
        rest.strip_prefix(tag)
            .and_then(|after| after.chars().next())
            .is_some_and(|c| c == '>' || c == '/' || c.is_whitespace())
    })
}

/// Turn raw output content into a value to validate, never failing.
///
/// `tags` is the recognized tag vocabulary used to spot leaked markup.
pub fn recover_output_content(
    output_type: &str,
    content: &str,
    schema: &Schema,
    tags: &[&str],
) -> Value {
    if schema.is_string() {
        return Value::String(content.to_string());
    }

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return schema.empty_value();
    }

    if looks_like_leaked_markup(trimmed, tags) {
        warn!(output_type, "Output content contains tag markup instead of JSON, using empty payload");
        return schema.empty_value();
    }

    match parse_json_content(trimmed) {
        Ok(value) => value,
        Err(e) => {
            warn!(output_type, error = %e, "Failed to parse output content as JSON, using empty payload");
            schema.empty_value()
        }
    }
}

/// Validate and handle a committed output entry.
///
/// Returns the entries to commit in its place. Unknown types and payloads that
/// parse but do not match the schema come back as recoverable errors.
pub async fn handle_output(
    outputs: &[Arc<dyn Output>],
    mut entry: OutputEntry,
    context: &ContextState,
    working_memory: &WorkingMemory,
    tags: &[&str],
) -> Result<Vec<OutputEntry>> {
    let Some(output) = outputs.iter().find(|o| o.output_type() == entry.output_type) else {
        return Err(RuntimeError::not_found(LogEntry::Output(entry)));
    };

    let data = match output.schema() {
        Some(schema) => {
            let recovered =
                recover_output_content(&entry.output_type, &entry.content, &schema, tags);
            match schema.validate(&recovered) {
                Ok(data) => data,
                Err(e) => {
                    entry.data = Some(recovered);
                    return Err(RuntimeError::parsing(LogEntry::Output(entry), e.to_string()));
                }
            }
        }
        None => Value::String(entry.content.clone()),
    };
    entry.data = Some(data.clone());

    debug!(output_type = %entry.output_type, id = %entry.header.id, "Handling output");

    let reply = {
        let ctx = OutputContext {
            context,
            working_memory,
            entry: &entry,
        };
        output.handle(&data, &ctx).await?
    };

    let committed = match reply {
        OutputReply::Unchanged => {
            entry.formatted = output.format(&data);
            entry.header.processed = true;
            vec![entry]
        }
        OutputReply::Single(response) => vec![apply_response(&entry, response, output.as_ref(), false)],
        OutputReply::FanOut(responses) => responses
            .into_iter()
            .map(|r| apply_response(&entry, r, output.as_ref(), true))
            .collect(),
    };

    Ok(committed)
}

fn apply_response(
    base: &OutputEntry,
    response: OutputResponse,
    output: &dyn Output,
    fresh_id: bool,
) -> OutputEntry {
    let mut entry = base.clone();
    if fresh_id {
        entry.header.id = Uuid::new_v4();
    }
    if let Some(data) = response.data {
        entry.data = Some(data);
    }
    entry.params.extend(response.params);
    entry.header.processed = response.processed.unwrap_or(true);
    entry.formatted = entry.data.as_ref().and_then(|d| output.format(d));
    entry
}
