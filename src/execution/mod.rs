//! Action dispatch pipeline
//!
//! lookup → parse → template resolution → schema validation → execution.
//! Everything after parsing runs off the parsing path in a spawned task that
//! reports back to the dispatcher over a channel.

pub mod task_runner;

pub use task_runner::TaskRunner;

use crate::actions::{ActionCallContext, ActionCtxRef, LogSink, ScopedMemory};
use crate::error::RuntimeError;
use crate::memory::WorkingMemory;
use crate::models::{ActionCall, ActionResult, ContextState, LogEntry};
use crate::state::MemoryStore;
use crate::template::{detect_templates, resolve_templates, TemplateInfo, TemplateResolver};
use crate::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages from action tasks back to the dispatcher
#[derive(Debug)]
pub enum DispatchMessage {
    /// Commit an entry produced by a running action
    Push(Box<LogEntry>),
    /// The call's payload resolved and validated
    CallPrepared { call_id: Uuid, data: Value },
    /// The call never reached its handler
    CallFailed { call_id: Uuid, error: RuntimeError },
    /// The call finished, successfully or with a captured error
    Completed(Box<ActionResult>),
}

/// A looked-up, parsed action call awaiting template resolution
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub action: ActionCtxRef,
    pub payload: Value,
    pub templates: Vec<TemplateInfo>,
}

/// Parse model-written JSON, tolerating a ```json fence
pub fn parse_json_content(content: &str) -> serde_json::Result<Value> {
    let trimmed = content.trim();
    let body = match trimmed.strip_prefix("```json") {
        Some(rest) => rest.strip_suffix("```").unwrap_or(rest),
        None => trimmed,
    };
    serde_json::from_str(body.trim())
}

/// Look up the action and parse the call's payload; empty content is `{}`
pub fn prepare_action_call(call: &ActionCall, actions: &[ActionCtxRef]) -> Result<PreparedCall> {
    let Some(action) = actions.iter().find(|a| a.name() == call.name) else {
        warn!(action = %call.name, call_id = %call.header.id, "Action not found");
        return Err(RuntimeError::not_found(LogEntry::ActionCall(call.clone())));
    };

    let content = call.content.trim();
    let payload = if content.is_empty() {
        Value::Object(Map::new())
    } else {
        parse_json_content(content).map_err(|e| {
            RuntimeError::parsing(LogEntry::ActionCall(call.clone()), e.to_string())
        })?
    };

    let templates = detect_templates(&payload);
    Ok(PreparedCall {
        action: action.clone(),
        payload,
        templates,
    })
}

/// Resolve templates, then validate against the action's schema
pub async fn resolve_call_payload(
    call: &ActionCall,
    prepared: PreparedCall,
    resolver: &dyn TemplateResolver,
) -> Result<Value> {
    let PreparedCall {
        action,
        mut payload,
        templates,
    } = prepared;

    if !templates.is_empty() {
        debug!(call_id = %call.header.id, count = templates.len(), "Resolving templates");
        resolve_templates(&mut payload, &templates, resolver).await?;
    }

    match action.action.schema() {
        Some(schema) => schema.validate(&payload).map_err(|e| {
            RuntimeError::parsing(LogEntry::ActionCall(call.clone()), e.to_string())
        }),
        None => Ok(payload),
    }
}

/// Executes validated action calls
pub struct ExecutionEngine {
    runner: TaskRunner,
    store: Arc<dyn MemoryStore>,
    default_retry: u32,
}

impl ExecutionEngine {
    pub fn new(runner: TaskRunner, store: Arc<dyn MemoryStore>, default_retry: u32) -> Self {
        Self {
            runner,
            store,
            default_retry,
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Run one call to completion. Never fails: handler errors that the
    /// action does not recover from become a captured `{error}` result.
    pub async fn handle_action_call(
        &self,
        action: &ActionCtxRef,
        call: ActionCall,
        context: ContextState,
        working_memory: Arc<WorkingMemory>,
        cancellation: CancellationToken,
        sink: LogSink,
    ) -> ActionResult {
        let definition = action.action.as_ref();
        let memory_def = definition.memory();

        let action_memory = match &memory_def {
            Some(def) => {
                let value = match self.store.get(&def.key).await {
                    Ok(Some(value)) => value,
                    Ok(None) => def.initial.clone(),
                    Err(e) => {
                        warn!(action = %call.name, key = %def.key, error = %e, "Failed to load action memory");
                        def.initial.clone()
                    }
                };
                ScopedMemory::new(def.key.clone(), value)
            }
            None => ScopedMemory::detached(),
        };

        let data = call.data.clone().unwrap_or(Value::Null);
        let ctx = ActionCallContext::new(
            context,
            call.clone(),
            working_memory,
            action_memory,
            cancellation.clone(),
            sink,
        );

        info!(action = %call.name, call_id = %call.header.id, data = %data, "Executing action");
        let start = Instant::now();
        let retry = definition.retry().unwrap_or(self.default_retry);

        let outcome = self
            .runner
            .run(&call.name, retry, &cancellation, |attempt| {
                debug!(action = %call.name, attempt, "Action attempt");
                definition.execute(data.clone(), &ctx)
            })
            .await;

        let outcome = match outcome {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(action = %call.name, call_id = %call.header.id, error = %e, "Action failed");
                definition.on_error(e, &ctx).await
            }
        };

        let succeeded = outcome.is_ok();
        let mut result = match outcome {
            Ok(value) => ActionResult::new(&call, value),
            Err(e) => ActionResult::captured_error(&call, e),
        };
        result.formatted = definition.format(&result);

        if let Some(def) = &memory_def {
            if let Err(e) = self.store.set(&def.key, ctx.action_memory.get().await).await {
                warn!(action = %call.name, key = %def.key, error = %e, "Failed to persist action memory");
            }
        }

        if succeeded {
            if let Err(e) = definition.on_success(&result, &ctx).await {
                warn!(action = %call.name, error = %e, "Success hook failed");
            }
        }

        debug!(
            action = %call.name,
            call_id = %call.header.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            error = result.is_error(),
            "Action completed"
        );

        result
    }
}
