//! Stream handler: the single writer of a run's log
//!
//! chunk → parser event → entry by index → (on done) route by kind →
//! commit to chain and working memory → trim and persist → notify.
//!
//! Action calls run as spawned tasks. Everything they produce comes back over
//! the dispatch channel and is applied here, so the chain, the entry store and
//! working memory are only ever mutated by the handler itself.

pub mod entries;
pub mod policy;
pub mod recovery;
pub mod resolver;
pub mod subscribers;

pub use entries::LogEntryStore;
pub use policy::{ContinueOnActionCalls, ContinuePolicy};
pub use resolver::{BuiltinResolver, CallOutcome, PendingCall};
pub use subscribers::{
    BroadcastSubscriber, LogNotification, LogSubscriber, RecordingSubscriber, SubscriberSet,
};

use crate::actions::{prepare_actions, ActionCtxRef, LogSink};
use crate::audit::{compute_chain_hash, RunRecord};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::execution::{
    parse_json_content, prepare_action_call, resolve_call_payload, DispatchMessage,
    ExecutionEngine, TaskRunner,
};
use crate::inputs::handle_input;
use crate::memory::{Episode, InMemoryVectorStore, MemoryGovernor, VectorStore, WorkingMemory};
use crate::models::{
    ActionCall, ActionResult, ContextState, EntryHeader, InputEntry, LogEntry, OutputEntry,
    RunEntry, StepEntry,
};
use crate::outputs::{handle_output, prepare_outputs, Output};
use crate::parser::{ElementEvent, StackElement, TagStreamParser};
use crate::registry::Catalog;
use crate::state::MemoryStore;
use crate::template::TemplateResolver;
use crate::Result;
use chrono::{DateTime, Utc};
use futures_util::{FutureExt, Stream, StreamExt};
use recovery::{recover, recover_output_handler};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

fn attribute_params(attributes: BTreeMap<String, String>) -> Map<String, Value> {
    attributes
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect()
}

/// Copy an element's current state onto its entry
fn apply_element(entry: &mut LogEntry, element: &StackElement) {
    entry.header_mut().done = element.done;
    let mut attributes = element.attributes.clone();

    match entry {
        LogEntry::Thought(thought) => thought.content.clone_from(&element.content),
        LogEntry::ActionCall(call) => {
            call.content.clone_from(&element.content);
            if let Some(name) = attributes.remove("name") {
                call.name = name;
            }
            call.params = attribute_params(attributes);
        }
        LogEntry::Output(output) => {
            output.content.clone_from(&element.content);
            if let Some(output_type) = attributes.remove("type") {
                output.output_type = output_type;
            }
            output.params = attribute_params(attributes);
        }
        LogEntry::Input(input) => {
            input.content.clone_from(&element.content);
            if let Some(input_type) = attributes.remove("type") {
                input.input_type = input_type;
            }
            input.params = attribute_params(attributes);
        }
        LogEntry::Event(event) => {
            if let Some(name) = attributes.remove("name") {
                event.name = name;
            }
            event.data = parse_json_content(&element.content)
                .unwrap_or_else(|_| Value::String(element.content.clone()));
            event.params = attribute_params(attributes);
        }
        LogEntry::ActionResult(_) | LogEntry::Step(_) | LogEntry::Run(_) => {}
    }
}

pub struct StreamHandler {
    config: Arc<RuntimeConfig>,
    context: ContextState,
    sub_contexts: Vec<ContextState>,
    catalog: Arc<Catalog>,
    engine: Arc<ExecutionEngine>,
    governor: MemoryGovernor,
    vector: Arc<dyn VectorStore>,
    external_resolver: Option<Arc<dyn TemplateResolver>>,
    subscribers: SubscriberSet,
    policy: Box<dyn ContinuePolicy>,
    cancellation: CancellationToken,

    working_memory: WorkingMemory,
    entries: LogEntryStore,
    chain: Vec<LogEntry>,
    errors: Vec<String>,
    calls: Vec<PendingCall>,
    call_outcomes: HashMap<Uuid, watch::Sender<Option<CallOutcome>>>,
    actions: Vec<ActionCtxRef>,
    outputs: Vec<Arc<dyn Output>>,
    step: u32,
    in_flight: usize,
    tx: mpsc::UnboundedSender<DispatchMessage>,
    rx: mpsc::UnboundedReceiver<DispatchMessage>,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl StreamHandler {
    pub fn new(
        config: Arc<RuntimeConfig>,
        catalog: Arc<Catalog>,
        context: ContextState,
        store: Arc<dyn MemoryStore>,
    ) -> Self {
        let runner = TaskRunner::new(
            config.max_concurrent_tasks,
            Duration::from_millis(config.retry_delay_ms),
        );
        let engine = Arc::new(ExecutionEngine::new(
            runner,
            store.clone(),
            config.default_retry,
        ));
        let governor = MemoryGovernor::new(config.retention.clone(), store);
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            config,
            context,
            sub_contexts: Vec::new(),
            catalog,
            engine,
            governor,
            vector: Arc::new(InMemoryVectorStore::new()),
            external_resolver: None,
            subscribers: SubscriberSet::new(),
            policy: Box::new(ContinueOnActionCalls),
            cancellation: CancellationToken::new(),
            working_memory: WorkingMemory::new(),
            entries: LogEntryStore::new(),
            chain: Vec::new(),
            errors: Vec::new(),
            calls: Vec::new(),
            call_outcomes: HashMap::new(),
            actions: Vec::new(),
            outputs: Vec::new(),
            step: 0,
            in_flight: 0,
            tx,
            rx,
            run_id: Uuid::nil(),
            started_at: Utc::now(),
        }
    }

    pub fn with_sub_contexts(mut self, sub_contexts: Vec<ContextState>) -> Self {
        self.sub_contexts = sub_contexts;
        self
    }

    pub fn with_vector_store(mut self, vector: Arc<dyn VectorStore>) -> Self {
        self.vector = vector;
        self
    }

    /// Resolver for template keys other than `calls` and `shortTermMemory`
    pub fn with_resolver(mut self, resolver: Arc<dyn TemplateResolver>) -> Self {
        self.external_resolver = Some(resolver);
        self
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn LogSubscriber>) -> Self {
        self.subscribers.add(subscriber);
        self
    }

    pub fn with_policy(mut self, policy: Box<dyn ContinuePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Load working memory, bind the catalog to this run and open step 1
    pub async fn start(&mut self) -> Result<()> {
        let key = self.config.working_memory_key(&self.context.id);
        self.working_memory = self.governor.load(&key).await?;

        self.actions = prepare_actions(
            &self.catalog.actions,
            &self.context,
            &self.sub_contexts,
            &self.working_memory,
        );
        self.outputs = prepare_outputs(&self.catalog.outputs, &self.context, &self.working_memory);
        self.started_at = Utc::now();

        info!(
            context_id = %self.context.id,
            context_type = %self.context.context_type,
            actions = self.actions.len(),
            outputs = self.outputs.len(),
            "Run started"
        );

        let run = RunEntry {
            header: EntryHeader::committed(),
            context_type: self.context.context_type.clone(),
        };
        self.run_id = run.header.id;
        self.commit(LogEntry::Run(run)).await;
        self.next_step().await;
        Ok(())
    }

    pub async fn next_step(&mut self) {
        self.step += 1;
        debug!(context_id = %self.context.id, step = self.step, "Starting step");
        let step = StepEntry {
            header: EntryHeader::committed(),
            step: self.step,
            step_type: self.context.context_type.clone(),
        };
        self.commit(LogEntry::Step(step)).await;
    }

    /// Parse a chunk stream to its end, applying action task messages as they
    /// arrive. Action tasks may still be running when this returns.
    pub async fn consume<S>(&mut self, stream: S) -> Result<()>
    where
        S: Stream<Item = String>,
    {
        let mut parser = TagStreamParser::new(&self.config.tags, self.entries.next_index());
        let mut stream = Box::pin(stream);

        debug!(context_id = %self.context.id, first_index = parser.next_index(), "Consuming stream");

        loop {
            tokio::select! {
                biased;

                _ = self.cancellation.cancelled() => {
                    warn!(context_id = %self.context.id, "Run aborted while consuming stream");
                    return Err(RuntimeError::Aborted);
                }
                Some(message) = self.rx.recv() => self.handle_message(message).await,
                chunk = stream.next() => match chunk {
                    Some(chunk) => {
                        for event in parser.feed(&chunk) {
                            self.handle_element(event).await;
                        }
                    }
                    None => break,
                },
            }
        }

        for event in parser.finish() {
            self.handle_element(event).await;
        }
        Ok(())
    }

    /// Commit an entry produced outside the stream through the same path
    pub async fn push(&mut self, mut entry: LogEntry) {
        entry.header_mut().done = true;
        self.route(entry).await;
    }

    /// Wait for every dispatched action call to report back
    pub async fn settle(&mut self) {
        loop {
            while let Ok(message) = self.rx.try_recv() {
                self.handle_message(message).await;
            }
            if self.in_flight == 0 {
                break;
            }
            match self.rx.recv().await {
                Some(message) => self.handle_message(message).await,
                None => break,
            }
        }
    }

    /// Settle and snapshot the run
    pub async fn finish(&mut self) -> RunRecord {
        self.settle().await;

        let chain = self.chain.clone();
        let record = RunRecord {
            run_id: self.run_id,
            context_id: self.context.id.clone(),
            context_type: self.context.context_type.clone(),
            chain_hash: compute_chain_hash(&chain),
            chain,
            errors: self.errors.clone(),
            steps: self.step,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };

        info!(
            context_id = %record.context_id,
            run_id = %record.run_id,
            entries = record.chain.len(),
            errors = record.errors.len(),
            steps = record.steps,
            "Run finished"
        );
        record
    }

    pub fn should_continue(&self) -> bool {
        if !self.errors.is_empty() {
            warn!(context_id = %self.context.id, count = self.errors.len(), "Run has errors");
            for (i, e) in self.errors.iter().enumerate() {
                debug!(context_id = %self.context.id, error_index = i, error = %e, "Run error");
            }
        }

        if self.cancellation.is_cancelled() {
            return false;
        }

        let decision = self.policy.should_continue(&self.chain, &self.errors);
        debug!(context_id = %self.context.id, step = self.step, decision, "Continue decision");
        decision
    }

    pub fn abort(&self) {
        info!(context_id = %self.context.id, "Aborting run");
        self.cancellation.cancel();
    }

    pub fn chain(&self) -> &[LogEntry] {
        &self.chain
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn working_memory(&self) -> &WorkingMemory {
        &self.working_memory
    }

    pub fn context(&self) -> &ContextState {
        &self.context
    }

    pub fn calls(&self) -> &[PendingCall] {
        &self.calls
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    async fn handle_element(&mut self, event: ElementEvent) {
        let element = event.element;
        let Some(kind) = self.config.tag(&element.tag).and_then(|t| t.kind) else {
            trace!(tag = %element.tag, index = element.index, "Wrapper element");
            return;
        };

        let entry = self.entries.get_or_create(element.index, kind);
        apply_element(entry, &element);
        let snapshot = entry.clone();

        if !element.done {
            self.subscribers.notify(&snapshot, false);
            return;
        }
        self.entries.remove(element.index);

        debug!(index = element.index, %kind, id = %snapshot.id(), "Element finalized");
        self.route(snapshot).await;
    }

    async fn route(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Input(input) => self.route_input(input).await,
            LogEntry::Output(output) => self.route_output(output).await,
            LogEntry::ActionCall(call) => self.dispatch_call(call).await,
            other => self.commit(other).await,
        }
    }

    async fn route_input(&mut self, mut input: InputEntry) {
        let outcome = handle_input(
            &self.catalog.inputs,
            &mut input,
            &self.context,
            &mut self.working_memory,
            self.vector.as_ref(),
        )
        .await;

        // Inputs that fail to resolve or handle are dropped, never committed
        match outcome {
            Ok(()) => self.commit(LogEntry::Input(input)).await,
            Err(e) if e.is_recoverable() => {
                debug!(input_type = %input.input_type, error = %e, "Input dropped");
            }
            Err(e) => self.record_error(&e),
        }
    }

    async fn route_output(&mut self, output: OutputEntry) {
        let original = output.clone();
        let config = self.config.clone();
        let outcome = handle_output(
            &self.outputs,
            output,
            &self.context,
            &self.working_memory,
            &config.tag_names(),
        )
        .await;

        let committed = match outcome {
            Ok(entries) => entries.into_iter().map(LogEntry::Output).collect(),
            Err(e) => {
                self.record_error(&e);
                if e.is_recoverable() {
                    recover(&e)
                } else {
                    recover_output_handler(&original, &e)
                }
            }
        };

        for entry in committed {
            self.commit(entry).await;
        }
    }

    async fn dispatch_call(&mut self, call: ActionCall) {
        let prepared = match prepare_action_call(&call, &self.actions) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.record_error(&e);
                self.commit(LogEntry::ActionCall(call)).await;
                for entry in recover(&e) {
                    self.commit(entry).await;
                }
                return;
            }
        };

        let call_id = call.header.id;
        let slot = self.calls.len();
        let resolver = BuiltinResolver::new(
            self.calls.clone(),
            self.contexts(),
            self.config.short_term_memory_context.clone(),
            self.external_resolver.clone(),
        );
        let (pending, outcome_tx) = PendingCall::new(call.name.clone(), call_id);
        self.calls.push(pending);
        self.call_outcomes.insert(call_id, outcome_tx);

        self.commit(LogEntry::ActionCall(call.clone())).await;

        let action = prepared.action.clone();
        let context = self.context_for(&action.ctx_id);
        let working_memory = Arc::new(self.working_memory.clone());
        let engine = self.engine.clone();
        let cancellation = self.cancellation.clone();
        let sink = LogSink::new(self.tx.clone());
        self.in_flight += 1;

        info!(action = %call.name, call_id = %call_id, slot, context_id = %action.ctx_id, "Dispatching action call");

        tokio::spawn(async move {
            let resolution = AssertUnwindSafe(resolve_call_payload(&call, prepared, &resolver))
                .catch_unwind()
                .await;
            let data = match resolution {
                Ok(Ok(data)) => data,
                Ok(Err(error)) => {
                    warn!(action = %call.name, call_id = %call_id, error = %error, "Action call rejected before execution");
                    sink.send(DispatchMessage::CallFailed { call_id, error });
                    return;
                }
                Err(_) => {
                    error!(action = %call.name, call_id = %call_id, "Template resolution panicked");
                    sink.send(DispatchMessage::CallFailed {
                        call_id,
                        error: RuntimeError::TemplateResolution(format!(
                            "resolver panicked while preparing {}",
                            call.name
                        )),
                    });
                    return;
                }
            };
            sink.send(DispatchMessage::CallPrepared {
                call_id,
                data: data.clone(),
            });

            let mut call = call;
            call.data = Some(data);
            let fallback = call.clone();

            let execution = engine.handle_action_call(
                &action,
                call,
                context,
                working_memory,
                cancellation,
                sink.clone(),
            );
            let result = match AssertUnwindSafe(execution).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!(action = %fallback.name, call_id = %call_id, "Action handler panicked");
                    ActionResult::captured_error(&fallback, "action handler panicked")
                }
            };

            sink.send(DispatchMessage::Completed(Box::new(result)));
        });
    }

    async fn handle_message(&mut self, message: DispatchMessage) {
        match message {
            DispatchMessage::Push(entry) => self.push(*entry).await,
            DispatchMessage::CallPrepared { call_id, data } => self.patch_call(call_id, data),
            DispatchMessage::CallFailed { call_id, error } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.resolve_pending(call_id, CallOutcome::Failed(error.to_string()));
                self.record_error(&error);
                for entry in recover(&error) {
                    self.commit(entry).await;
                }
            }
            DispatchMessage::Completed(result) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.resolve_pending(result.call_id, CallOutcome::Completed((*result).clone()));
                self.commit(LogEntry::ActionResult(*result)).await;
            }
        }
    }

    fn resolve_pending(&mut self, call_id: Uuid, outcome: CallOutcome) {
        match self.call_outcomes.remove(&call_id) {
            Some(tx) => {
                tx.send_replace(Some(outcome));
            }
            None => warn!(call_id = %call_id, "Outcome for an unknown call"),
        }
    }

    /// Record a call's resolved payload everywhere the call is held
    fn patch_call(&mut self, call_id: Uuid, data: Value) {
        let mut updated = None;
        if let Some(LogEntry::ActionCall(call)) = self.chain.iter_mut().find(|e| e.id() == call_id) {
            call.data = Some(data.clone());
            updated = Some(LogEntry::ActionCall(call.clone()));
        }
        if let Some(call) = self.working_memory.call_mut(call_id) {
            call.data = Some(data.clone());
        }

        if let Some(entry) = updated {
            trace!(call_id = %call_id, "Call payload resolved");
            self.subscribers.notify(&entry, true);
        }
    }

    async fn commit(&mut self, entry: LogEntry) {
        trace!(kind = %entry.kind(), id = %entry.id(), "Committing entry");
        self.chain.push(entry.clone());
        self.working_memory.push(entry.clone());

        if let LogEntry::ActionResult(result) = &entry {
            self.record_episode(result).await;
        }

        let key = self.config.working_memory_key(&self.context.id);
        if let Err(e) = self.governor.commit(&key, &mut self.working_memory).await {
            warn!(context_id = %self.context.id, error = %e, "Failed to persist working memory");
            self.errors.push(e.to_string());
        }

        self.subscribers.notify(&entry, true);
    }

    async fn record_episode(&self, result: &ActionResult) {
        let Some(thought) = self.working_memory.last_thought() else {
            return;
        };
        let call = self
            .working_memory
            .calls
            .iter()
            .find(|c| c.header.id == result.call_id)
            .or_else(|| self.working_memory.last_call());
        let Some(call) = call else {
            return;
        };

        let episode = Episode::new(thought, call, result);
        let document = match serde_json::to_value(&episode) {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, "Failed to serialize episode");
                return;
            }
        };

        match self.vector.upsert(&self.context.id, vec![document]).await {
            Ok(()) => debug!(context_id = %self.context.id, action = %episode.action, "Episode stored"),
            Err(e) => warn!(context_id = %self.context.id, error = %e, "Failed to store episode"),
        }
    }

    fn record_error(&mut self, error: &RuntimeError) {
        warn!(context_id = %self.context.id, error = %error, "Run error");
        self.errors.push(error.to_string());
    }

    fn contexts(&self) -> Vec<ContextState> {
        std::iter::once(&self.context)
            .chain(self.sub_contexts.iter())
            .cloned()
            .collect()
    }

    fn context_for(&self, context_id: &str) -> ContextState {
        self.sub_contexts
            .iter()
            .find(|c| c.id == context_id)
            .unwrap_or(&self.context)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionCallContext};
    use crate::config::TagConfig;
    use crate::inputs::Input;
    use crate::models::EntryKind;
    use crate::schema::Schema;
    use crate::state::InMemoryMemoryStore;
    use futures_util::stream;
    use serde_json::json;
    use std::sync::Mutex;

    struct GetMarket;

    #[async_trait::async_trait]
    impl Action for GetMarket {
        fn name(&self) -> &str {
            "getMarket"
        }

        async fn execute(&self, _data: Value, _ctx: &ActionCallContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!({ "market": "BTC-USD-PERP" }))
        }
    }

    #[derive(Default)]
    struct OpenOrder {
        received: Mutex<Vec<Value>>,
    }

    #[async_trait::async_trait]
    impl Action for OpenOrder {
        fn name(&self) -> &str {
            "openOrder"
        }

        fn schema(&self) -> Option<Schema> {
            Some(Schema::object([("market", Schema::String)]))
        }

        async fn execute(&self, data: Value, ctx: &ActionCallContext) -> Result<Value> {
            self.received.lock().unwrap().push(data.clone());
            ctx.emit("order:placed", json!({ "market": data["market"] }));
            Ok(json!({ "orderId": "o-1" }))
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl Action for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _data: Value, ctx: &ActionCallContext) -> Result<Value> {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => Err(RuntimeError::Aborted),
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!({})),
            }
        }
    }

    struct Message;

    #[async_trait::async_trait]
    impl Output for Message {
        fn output_type(&self) -> &str {
            "cli:message"
        }

        fn schema(&self) -> Option<Schema> {
            Some(Schema::object([("message", Schema::String)]))
        }
    }

    struct Chat;

    #[async_trait::async_trait]
    impl Input for Chat {
        fn input_type(&self) -> &str {
            "cli:message"
        }
    }

    struct BrokenResolver;

    #[async_trait::async_trait]
    impl TemplateResolver for BrokenResolver {
        async fn resolve(&self, _primary_key: &str, _path: &str) -> Result<Option<Value>> {
            panic!("resolver bug");
        }
    }

    struct Panicking;

    impl LogSubscriber for Panicking {
        fn notify(&self, _entry: &LogEntry, _done: bool) -> Result<()> {
            panic!("subscriber bug");
        }
    }

    struct Fixture {
        handler: StreamHandler,
        recorder: Arc<RecordingSubscriber>,
        vector: Arc<InMemoryVectorStore>,
        open_order: Arc<OpenOrder>,
    }

    fn config() -> Arc<RuntimeConfig> {
        let mut config = RuntimeConfig::default();
        config
            .tags
            .push(TagConfig::new("thought", Some(EntryKind::Thought)));
        config.retry_delay_ms = 0;
        Arc::new(config)
    }

    fn fixture_with_store(store: Arc<InMemoryMemoryStore>) -> Fixture {
        let open_order = Arc::new(OpenOrder::default());
        let catalog = Catalog::new()
            .with_action(Arc::new(GetMarket))
            .and_then(|c| c.with_action(open_order.clone()))
            .and_then(|c| c.with_action(Arc::new(Slow)))
            .and_then(|c| c.with_output(Arc::new(Message)))
            .and_then(|c| c.with_input(Arc::new(Chat)))
            .unwrap();

        let recorder = Arc::new(RecordingSubscriber::new());
        let vector = Arc::new(InMemoryVectorStore::new());
        let handler = StreamHandler::new(
            config(),
            Arc::new(catalog),
            ContextState::new("cli:main", "cli"),
            store,
        )
        .with_vector_store(vector.clone())
        .with_subscriber(recorder.clone());

        Fixture {
            handler,
            recorder,
            vector,
            open_order,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(InMemoryMemoryStore::new()))
    }

    fn chunks(text: &str, size: usize) -> impl Stream<Item = String> {
        let chars: Vec<char> = text.chars().collect();
        let parts: Vec<String> = chars.chunks(size).map(|c| c.iter().collect()).collect();
        stream::iter(parts)
    }

    fn of_kind(chain: &[LogEntry], kind: EntryKind) -> Vec<&LogEntry> {
        chain.iter().filter(|e| e.kind() == kind).collect()
    }

    fn events_named<'a>(chain: &'a [LogEntry], name: &str) -> Vec<&'a LogEntry> {
        chain
            .iter()
            .filter(|e| e.kind() == EntryKind::Event && e.name() == Some(name))
            .collect()
    }

    async fn run(fixture: &mut Fixture, text: &str, chunk_size: usize) -> RunRecord {
        fixture.handler.start().await.unwrap();
        fixture
            .handler
            .consume(chunks(text, chunk_size))
            .await
            .unwrap();
        fixture.handler.finish().await
    }

    #[tokio::test]
    async fn test_missing_action_degrades_to_event() {
        let text = "<thought>t1</thought><action_call name=\"x\">{}</action_call>";

        for chunk_size in [1, 3, 7, text.len()] {
            let mut fixture = fixture();
            let record = run(&mut fixture, text, chunk_size).await;

            let thoughts = of_kind(&record.chain, EntryKind::Thought);
            assert_eq!(thoughts.len(), 1);
            assert_eq!(thoughts[0].content(), Some("t1"));
            assert_eq!(events_named(&record.chain, "error:action_call").len(), 1);
            assert!(of_kind(&record.chain, EntryKind::ActionResult).is_empty());
            assert_eq!(record.errors.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_calls_template_waits_for_earlier_call() {
        let mut fixture = fixture();
        let text = concat!(
            "<thought>check the market then trade</thought>",
            "<action_call name=\"getMarket\">{}</action_call>",
            "<action_call name=\"openOrder\">{\"market\": \"{{calls.0.data.market}}\"}</action_call>",
        );

        let record = run(&mut fixture, text, 16).await;

        assert_eq!(
            *fixture.open_order.received.lock().unwrap(),
            vec![json!({ "market": "BTC-USD-PERP" })]
        );
        assert_eq!(of_kind(&record.chain, EntryKind::ActionResult).len(), 2);
        assert!(record.errors.is_empty());

        let open_call = record
            .chain
            .iter()
            .find_map(|e| match e {
                LogEntry::ActionCall(c) if c.name == "openOrder" => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(open_call.data, Some(json!({ "market": "BTC-USD-PERP" })));

        // Emitted from inside the action
        assert_eq!(events_named(&record.chain, "order:placed").len(), 1);
        // One episode per result, both after the thought
        assert_eq!(fixture.vector.count("cli:main").await, 2);
        assert!(fixture.handler.should_continue());
    }

    #[tokio::test]
    async fn test_unresolved_template_never_runs_handler() {
        let mut fixture = fixture();
        let text = concat!(
            "<action_call name=\"openOrder\">{\"market\": \"{{calls.4.data.market}}\"}</action_call>",
            "<action_call name=\"openOrder\">{\"market\": \"{{portfolio.market}}\"}</action_call>",
        );

        let record = run(&mut fixture, text, 5).await;

        assert!(fixture.open_order.received.lock().unwrap().is_empty());
        assert!(of_kind(&record.chain, EntryKind::ActionResult).is_empty());
        assert_eq!(record.errors.len(), 2);
        assert!(fixture
            .handler
            .calls()
            .iter()
            .all(|c| matches!(c.outcome(), Some(CallOutcome::Failed(_)))));
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_parsing_event() {
        let mut fixture = fixture();
        let record = run(
            &mut fixture,
            "<action_call name=\"openOrder\">{\"market\": 42}</action_call>",
            8,
        )
        .await;

        assert!(fixture.open_order.received.lock().unwrap().is_empty());
        assert_eq!(
            events_named(&record.chain, "error:action_call:parsingError").len(),
            1
        );
    }

    #[tokio::test]
    async fn test_output_recovery() {
        let mut fixture = fixture();
        let text = concat!(
            "<output type=\"cli:message\">not json</output>",
            "<output type=\"email\">{}</output>",
        );

        let record = run(&mut fixture, text, 4).await;

        let outputs: Vec<&OutputEntry> = record
            .chain
            .iter()
            .filter_map(|e| match e {
                LogEntry::Output(o) => Some(o),
                _ => None,
            })
            .collect();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].data, Some(json!({ "message": "" })));
        assert!(outputs[0].params.get("error").is_none());
        assert_eq!(outputs[1].params["error"], "OutputTypeNotFound");
        assert_eq!(events_named(&record.chain, "error:output").len(), 1);
    }

    #[tokio::test]
    async fn test_abort_is_observed_by_running_action() {
        let mut fixture = fixture();
        fixture.handler.start().await.unwrap();
        fixture
            .handler
            .consume(chunks("<action_call name=\"slow\"></action_call>", 6))
            .await
            .unwrap();

        fixture.handler.abort();
        let record = fixture.handler.finish().await;

        let results = of_kind(&record.chain, EntryKind::ActionResult);
        assert_eq!(results.len(), 1);
        match results[0] {
            LogEntry::ActionResult(r) => assert_eq!(r.data["error"], "Run aborted"),
            _ => unreachable!(),
        }
        assert!(!fixture.handler.should_continue());

        let consumed = fixture
            .handler
            .consume(chunks("<thought>late</thought>", 4))
            .await;
        assert!(matches!(consumed, Err(RuntimeError::Aborted)));
    }

    #[tokio::test]
    async fn test_subscribers_see_streaming_and_committed_entries() {
        let mut fixture = fixture();
        fixture.handler = fixture.handler.with_subscriber(Arc::new(Panicking));

        let record = run(&mut fixture, "<thought>partial thoughts</thought>", 3).await;

        let notifications = fixture.recorder.notifications();
        assert!(notifications.iter().any(|n| !n.done));
        assert_eq!(fixture.recorder.committed(), record.chain);
    }

    #[tokio::test]
    async fn test_steps_and_continue_policy() {
        let mut fixture = fixture();
        fixture.handler.start().await.unwrap();
        fixture
            .handler
            .consume(chunks("<action_call name=\"getMarket\">{}</action_call>", 9))
            .await
            .unwrap();
        fixture.handler.settle().await;
        assert!(fixture.handler.should_continue());

        fixture.handler.next_step().await;
        fixture
            .handler
            .consume(chunks("<thought>market is BTC-USD-PERP</thought>", 9))
            .await
            .unwrap();
        let record = fixture.handler.finish().await;

        assert!(!fixture.handler.should_continue());
        assert_eq!(record.steps, 2);

        let indices: Vec<u64> = record.chain.iter().filter_map(|e| e.header().index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_working_memory_persists_across_runs() {
        let store = Arc::new(InMemoryMemoryStore::new());

        let mut first = fixture_with_store(store.clone());
        run(&mut first, "<thought>remember me</thought>", 5).await;
        assert!(store.get("working-memory:cli:main").await.unwrap().is_some());

        let mut second = fixture_with_store(store);
        second.handler.start().await.unwrap();
        let memory = second.handler.working_memory();
        assert_eq!(memory.last_thought().unwrap().content, "remember me");
        assert_eq!(memory.runs.len(), 2);
        assert!(memory.steps.is_empty());
    }

    fn input(input_type: &str, content: &str) -> LogEntry {
        LogEntry::Input(InputEntry {
            header: EntryHeader::new(None),
            input_type: input_type.to_string(),
            content: content.to_string(),
            data: None,
            params: Map::new(),
            formatted: None,
        })
    }

    #[tokio::test]
    async fn test_pushed_input_is_committed() {
        let mut fixture = fixture();
        fixture.handler.start().await.unwrap();

        fixture.handler.push(input("cli:message", "buy the dip")).await;

        let inputs = &fixture.handler.working_memory().inputs;
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].header.done);
        assert!(inputs[0].header.processed);
        assert_eq!(inputs[0].data, Some(json!("buy the dip")));
        assert!(fixture.handler.errors().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_input_is_dropped() {
        let mut fixture = fixture();
        fixture.handler.start().await.unwrap();
        let committed_before = fixture.handler.chain().len();

        fixture.handler.push(input("telegram:message", "hello")).await;

        assert_eq!(fixture.handler.chain().len(), committed_before);
        assert!(fixture.handler.working_memory().inputs.is_empty());
        assert!(of_kind(fixture.handler.chain(), EntryKind::Event).is_empty());
        assert!(fixture.handler.errors().is_empty());
    }

    #[tokio::test]
    async fn test_resolver_panic_fails_only_that_call() {
        let mut fixture = fixture();
        fixture.handler = fixture.handler.with_resolver(Arc::new(BrokenResolver));
        fixture.handler.start().await.unwrap();

        let text = concat!(
            "<action_call name=\"openOrder\">{\"market\": \"{{portfolio.market}}\"}</action_call>",
            "<action_call name=\"getMarket\">{}</action_call>",
        );
        fixture.handler.consume(chunks(text, 7)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), fixture.handler.settle())
            .await
            .expect("settle hung after a resolver panic");
        assert_eq!(fixture.handler.in_flight(), 0);

        let calls = fixture.handler.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0].outcome(), Some(CallOutcome::Failed(_))));
        assert!(matches!(calls[1].outcome(), Some(CallOutcome::Completed(_))));
        assert!(fixture.open_order.received.lock().unwrap().is_empty());

        let record = fixture.handler.finish().await;
        assert_eq!(of_kind(&record.chain, EntryKind::ActionResult).len(), 1);
        assert_eq!(record.errors.len(), 1);
    }
}
