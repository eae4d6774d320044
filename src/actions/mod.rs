//! Action trait and registry
//!
//! Actions are the side-effecting handlers a model invokes with
//! `<action_call name="...">`. Each run binds the enabled actions to the
//! context allowed to invoke them.

pub mod context;

pub use context::{ActionCallContext, LogSink, ScopedMemory};

use crate::error::RuntimeError;
use crate::memory::WorkingMemory;
use crate::models::{ActionResult, ContextState};
use crate::schema::Schema;
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Memory slice an action owns across calls
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMemory {
    pub key: String,
    /// Value used when nothing is persisted under `key` yet
    pub initial: Value,
}

impl ActionMemory {
    pub fn new(key: impl Into<String>, initial: Value) -> Self {
        Self {
            key: key.into(),
            initial,
        }
    }
}

/// Trait for a single action
#[async_trait::async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Payload schema; without one the parsed payload is passed through
    fn schema(&self) -> Option<Schema> {
        None
    }

    /// Retry count overriding the runtime default
    fn retry(&self) -> Option<u32> {
        None
    }

    fn memory(&self) -> Option<ActionMemory> {
        None
    }

    /// Restrict the action to contexts of this type
    fn context_type(&self) -> Option<&str> {
        None
    }

    fn enabled(&self, _context: &ContextState, _working_memory: &WorkingMemory) -> bool {
        true
    }

    async fn execute(&self, data: Value, ctx: &ActionCallContext) -> Result<Value>;

    /// Recover from a failed execution; the default rethrows
    async fn on_error(&self, error: RuntimeError, _ctx: &ActionCallContext) -> Result<Value> {
        Err(error)
    }

    fn format(&self, _result: &ActionResult) -> Option<String> {
        None
    }

    async fn on_success(&self, _result: &ActionResult, _ctx: &ActionCallContext) -> Result<()> {
        Ok(())
    }
}

/// Action registry for looking up actions by name
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
    order: Vec<String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, action: Arc<dyn Action>) -> Result<()> {
        let name = action.name().to_string();
        if self.actions.contains_key(&name) {
            return Err(RuntimeError::InvalidRegistry(format!(
                "duplicate action: {}",
                name
            )));
        }
        self.order.push(name.clone());
        self.actions.insert(name, action);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Actions in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Action>> {
        self.order.iter().filter_map(|name| self.actions.get(name))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An action bound to the id of the context allowed to invoke it
#[derive(Clone)]
pub struct ActionCtxRef {
    pub action: Arc<dyn Action>,
    pub ctx_id: String,
}

impl ActionCtxRef {
    pub fn name(&self) -> &str {
        self.action.name()
    }
}

impl std::fmt::Debug for ActionCtxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionCtxRef")
            .field("name", &self.name())
            .field("ctx_id", &self.ctx_id)
            .finish()
    }
}

/// Bind every enabled action to a context for this run.
///
/// Unrestricted actions bind to the run's own context. Actions restricted to
/// a context type bind to the first of the run context or its sub-contexts
/// with that type.
pub fn prepare_actions(
    registry: &ActionRegistry,
    context: &ContextState,
    sub_contexts: &[ContextState],
    working_memory: &WorkingMemory,
) -> Vec<ActionCtxRef> {
    let mut prepared = Vec::with_capacity(registry.len());

    for action in registry.iter() {
        let target = match action.context_type() {
            None => Some(context),
            Some(wanted) => std::iter::once(context)
                .chain(sub_contexts.iter())
                .find(|c| c.context_type == wanted),
        };

        let Some(target) = target else {
            debug!(action = action.name(), "No context of the required type, skipping");
            continue;
        };

        if !action.enabled(target, working_memory) {
            debug!(action = action.name(), context_id = %target.id, "Action disabled");
            continue;
        }

        prepared.push(ActionCtxRef {
            action: action.clone(),
            ctx_id: target.id.clone(),
        });
    }

    prepared
}
