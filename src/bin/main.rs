use agent_stream_orchestrator::{
    audit::RunLog,
    state::InMemoryMemoryStore,
    Action, ActionCallContext, ActionMemory, Catalog, ContextState, Output, RuntimeConfig,
    Schema, StreamHandler,
};
use futures_util::stream;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_STEPS: usize = 4;
const CHUNK_SIZE: usize = 12;

/// Recorded model output, one transcript per step
const DEMO_TRANSCRIPT: &str = r#"<think>The user wants a BTC position. Look up the market first.</think>
<action_call name="getMarket">{"symbol": "BTC"}</action_call>
<action_call name="openOrder">{"market": "{{calls.0.data.market}}", "size": 0.1}</action_call>
---
<think>Order is open, tell the user.</think>
<response><output type="cli:message">{"message": "Opened 0.1 on BTC-USD-PERP"}</output></response>
"#;

struct GetMarket;

#[async_trait::async_trait]
impl Action for GetMarket {
    fn name(&self) -> &str {
        "getMarket"
    }

    fn description(&self) -> &str {
        "Look up the perpetual market for a symbol"
    }

    fn schema(&self) -> Option<Schema> {
        Some(Schema::object([("symbol", Schema::String)]))
    }

    async fn execute(
        &self,
        data: Value,
        _ctx: &ActionCallContext,
    ) -> agent_stream_orchestrator::Result<Value> {
        let symbol = data["symbol"].as_str().unwrap_or("BTC");
        Ok(json!({ "market": format!("{}-USD-PERP", symbol) }))
    }
}

struct OpenOrder;

#[async_trait::async_trait]
impl Action for OpenOrder {
    fn name(&self) -> &str {
        "openOrder"
    }

    fn schema(&self) -> Option<Schema> {
        Some(Schema::object([
            ("market", Schema::String),
            ("size", Schema::Number),
        ]))
    }

    fn memory(&self) -> Option<ActionMemory> {
        Some(ActionMemory::new("orders", json!({ "open": [] })))
    }

    async fn execute(
        &self,
        data: Value,
        ctx: &ActionCallContext,
    ) -> agent_stream_orchestrator::Result<Value> {
        let order = json!({ "market": data["market"], "size": data["size"] });
        ctx.action_memory
            .update(|m| {
                if let Some(open) = m["open"].as_array_mut() {
                    open.push(order.clone());
                }
            })
            .await;
        ctx.emit("order:opened", order.clone());
        Ok(order)
    }

    fn format(&self, result: &agent_stream_orchestrator::ActionResult) -> Option<String> {
        Some(format!("opened {} x {}", result.data["market"], result.data["size"]))
    }
}

struct CliMessage;

#[async_trait::async_trait]
impl Output for CliMessage {
    fn output_type(&self) -> &str {
        "cli:message"
    }

    fn schema(&self) -> Option<Schema> {
        Some(Schema::object([("message", Schema::String)]))
    }

    fn format(&self, data: &Value) -> Option<String> {
        data["message"].as_str().map(str::to_string)
    }
}

fn chunked(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_SIZE)
        .map(|c| c.iter().collect())
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Stream runner starting");

    let config = Arc::new(RuntimeConfig::from_env()?);

    let transcript = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEMO_TRANSCRIPT.to_string(),
    };

    let catalog = Catalog::new()
        .with_action(Arc::new(GetMarket))?
        .with_action(Arc::new(OpenOrder))?
        .with_output(Arc::new(CliMessage))?;
    catalog.validate()?;

    let store = Arc::new(InMemoryMemoryStore::new());
    let mut handler = StreamHandler::new(
        config,
        Arc::new(catalog),
        ContextState::new("cli:demo", "cli"),
        store,
    );

    handler.start().await?;

    let steps: Vec<&str> = transcript.split("\n---\n").collect();
    for (i, step) in steps.iter().enumerate().take(MAX_STEPS) {
        if i > 0 {
            if !handler.should_continue() {
                info!(step = i, "Run complete");
                break;
            }
            handler.next_step().await;
        }

        handler.consume(stream::iter(chunked(step))).await?;
        handler.settle().await;
    }

    let record = handler.finish().await;
    let log = RunLog::new();
    let run_id = log.record(record.clone()).await?;
    if !log.verify_integrity(run_id).await? {
        warn!(%run_id, "Run failed integrity verification");
    }

    println!("\n=== COMMITTED CHAIN ===");
    println!("{}", serde_json::to_string_pretty(&record.chain)?);
    println!("\nRun ID: {}", record.run_id);
    println!("Steps: {}", record.steps);
    println!("Chain hash: {}", record.chain_hash);
    if !record.errors.is_empty() {
        println!("\nErrors:");
        for (i, e) in record.errors.iter().enumerate() {
            println!("  {}: {}", i + 1, e);
        }
    }

    Ok(())
}
