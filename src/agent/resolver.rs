//! Built-in template resolution for `calls` and `shortTermMemory`

use crate::error::RuntimeError;
use crate::models::{ActionResult, ContextState};
use crate::template::{
    get_path_segments, get_value_by_path, resolve_path_segments, TemplateResolver,
};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

pub const CALLS_KEY: &str = "calls";
pub const SHORT_TERM_MEMORY_KEY: &str = "shortTermMemory";

/// How a dispatched call ended
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Completed(ActionResult),
    /// Never reached its handler
    Failed(String),
}

/// Handle to an in-flight action call
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub name: String,
    pub call_id: Uuid,
    rx: watch::Receiver<Option<CallOutcome>>,
}

impl PendingCall {
    pub fn new(
        name: impl Into<String>,
        call_id: Uuid,
    ) -> (Self, watch::Sender<Option<CallOutcome>>) {
        let (tx, rx) = watch::channel(None);
        let pending = Self {
            name: name.into(),
            call_id,
            rx,
        };
        (pending, tx)
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the call's result; a call that never ran is an error
    pub async fn wait(&self) -> Result<ActionResult> {
        let mut rx = self.rx.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| {
                RuntimeError::TemplateResolution(format!(
                    "call {} ({}) was dropped before completing",
                    self.name, self.call_id
                ))
            })?
            .clone();

        match outcome {
            Some(CallOutcome::Completed(result)) => Ok(result),
            Some(CallOutcome::Failed(reason)) => Err(RuntimeError::TemplateResolution(format!(
                "call {} ({}) failed: {}",
                self.name, self.call_id, reason
            ))),
            None => Err(RuntimeError::TemplateResolution(format!(
                "call {} ({}) has no outcome",
                self.name, self.call_id
            ))),
        }
    }
}

/// Resolver handed to one action call.
///
/// `calls` only covers the calls dispatched before this one, so a template can
/// never wait on itself or on a later call.
pub struct BuiltinResolver {
    calls: Vec<PendingCall>,
    contexts: Vec<ContextState>,
    short_term_memory_context: String,
    external: Option<Arc<dyn TemplateResolver>>,
}

impl BuiltinResolver {
    pub fn new(
        calls: Vec<PendingCall>,
        contexts: Vec<ContextState>,
        short_term_memory_context: impl Into<String>,
        external: Option<Arc<dyn TemplateResolver>>,
    ) -> Self {
        Self {
            calls,
            contexts,
            short_term_memory_context: short_term_memory_context.into(),
            external,
        }
    }

    async fn resolve_call(&self, path: &str) -> Result<Option<Value>> {
        let segments = get_path_segments(path);
        let Some(index) = segments.first().and_then(|s| s.parse::<usize>().ok()) else {
            return Ok(None);
        };
        let Some(pending) = self.calls.get(index) else {
            debug!(index, known = self.calls.len(), "Template references an unknown call");
            return Ok(None);
        };

        debug!(index, call_id = %pending.call_id, action = %pending.name, "Waiting for referenced call");
        let result = serde_json::to_value(pending.wait().await?)?;
        Ok(resolve_path_segments(&result, &segments[1..]).cloned())
    }

    fn resolve_short_term_memory(&self, path: &str) -> Option<Value> {
        let context = self
            .contexts
            .iter()
            .find(|c| c.context_type == self.short_term_memory_context)?;
        get_value_by_path(&context.memory, path).cloned()
    }
}

#[async_trait::async_trait]
impl TemplateResolver for BuiltinResolver {
    async fn resolve(&self, primary_key: &str, path: &str) -> Result<Option<Value>> {
        match primary_key {
            CALLS_KEY => self.resolve_call(path).await,
            SHORT_TERM_MEMORY_KEY => Ok(self.resolve_short_term_memory(path)),
            other => match &self.external {
                Some(external) => external.resolve(other, path).await,
                None => Err(RuntimeError::NotImplemented(format!(
                    "template primary key {}",
                    other
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionCall, EntryHeader};
    use serde_json::{json, Map};
    use std::time::Duration;

    fn result(data: Value) -> ActionResult {
        let call = ActionCall {
            header: EntryHeader::committed(),
            name: "getMarket".to_string(),
            content: String::new(),
            data: None,
            params: Map::new(),
        };
        ActionResult::new(&call, data)
    }

    fn resolver(calls: Vec<PendingCall>) -> BuiltinResolver {
        let memory = ContextState::new("stm:1", "shortTermMemory")
            .with_memory(json!({ "goals": [{ "title": "hedge" }] }));
        BuiltinResolver::new(
            calls,
            vec![ContextState::new("cli:main", "cli"), memory],
            "shortTermMemory",
            None,
        )
    }

    #[tokio::test]
    async fn test_calls_waits_for_completion() {
        let (pending, tx) = PendingCall::new("getMarket", Uuid::new_v4());
        let resolver = resolver(vec![pending]);

        let completer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send_replace(Some(CallOutcome::Completed(result(
                json!({ "market": "BTC-USD-PERP" }),
            ))));
            tx
        });

        let value = resolver.resolve("calls", "0.data.market").await.unwrap();
        assert_eq!(value, Some(json!("BTC-USD-PERP")));
        completer.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_or_unknown_call() {
        let (pending, tx) = PendingCall::new("getMarket", Uuid::new_v4());
        tx.send_replace(Some(CallOutcome::Failed("bad payload".to_string())));
        let resolver = resolver(vec![pending]);

        assert!(resolver.resolve("calls", "0.data").await.is_err());
        assert_eq!(resolver.resolve("calls", "1.data").await.unwrap(), None);
        assert_eq!(resolver.resolve("calls", "data").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_short_term_memory_and_unknown_keys() {
        let resolver = resolver(Vec::new());

        assert_eq!(
            resolver.resolve("shortTermMemory", "goals[0].title").await.unwrap(),
            Some(json!("hedge"))
        );
        assert_eq!(
            resolver.resolve("shortTermMemory", "tasks").await.unwrap(),
            None
        );
        assert!(matches!(
            resolver.resolve("portfolio", "cash").await,
            Err(RuntimeError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_external_resolver_handles_other_keys() {
        struct Portfolio;

        #[async_trait::async_trait]
        impl TemplateResolver for Portfolio {
            async fn resolve(&self, _key: &str, path: &str) -> Result<Option<Value>> {
                Ok(Some(json!(format!("portfolio:{}", path))))
            }
        }

        let resolver = BuiltinResolver::new(Vec::new(), Vec::new(), "stm", Some(Arc::new(Portfolio)));
        let value = tokio_test::block_on(resolver.resolve("portfolio", "cash")).unwrap();
        assert_eq!(value, Some(json!("portfolio:cash")));
    }
}
