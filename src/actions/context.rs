//! Per-call execution context handed to action handlers

use crate::execution::DispatchMessage;
use crate::memory::WorkingMemory;
use crate::models::{ActionCall, ContextState, EventEntry, LogEntry};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The memory slice owned by one action, keyed by the action's memory key
#[derive(Debug, Clone, Default)]
pub struct ScopedMemory {
    key: Option<String>,
    value: Arc<Mutex<Value>>,
}

impl ScopedMemory {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            value: Arc::new(Mutex::new(value)),
        }
    }

    /// Placeholder for actions that declare no memory
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub async fn get(&self) -> Value {
        self.value.lock().await.clone()
    }

    pub async fn set(&self, value: Value) {
        *self.value.lock().await = value;
    }

    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Value),
    {
        let mut guard = self.value.lock().await;
        f(&mut guard);
    }
}

/// Channel back to the dispatcher, the single writer of the log
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<DispatchMessage>,
}

impl LogSink {
    pub fn new(tx: mpsc::UnboundedSender<DispatchMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: DispatchMessage) {
        if self.tx.send(message).is_err() {
            warn!("Dispatcher is gone, dropping message");
        }
    }
}

#[derive(Clone)]
pub struct ActionCallContext {
    /// State of the context the action is bound to
    pub context: ContextState,
    pub call: ActionCall,
    /// Working memory as of the moment the call was dispatched
    pub working_memory: Arc<WorkingMemory>,
    pub action_memory: ScopedMemory,
    pub cancellation: CancellationToken,
    sink: LogSink,
}

impl ActionCallContext {
    pub fn new(
        context: ContextState,
        call: ActionCall,
        working_memory: Arc<WorkingMemory>,
        action_memory: ScopedMemory,
        cancellation: CancellationToken,
        sink: LogSink,
    ) -> Self {
        Self {
            context,
            call,
            working_memory,
            action_memory,
            cancellation,
            sink,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Commit an event entry into the run's log
    pub fn emit(&self, name: impl Into<String>, data: Value) {
        let mut event = EventEntry::new(name, data, Map::new());
        event.header.processed = true;
        debug!(call_id = %self.call.header.id, event = %event.name, "Action emitted event");
        self.push(LogEntry::Event(event));
    }

    /// Commit an arbitrary entry into the run's log
    pub fn push(&self, entry: LogEntry) {
        self.sink.send(DispatchMessage::Push(Box::new(entry)));
    }
}
