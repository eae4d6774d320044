//! Agent Stream Orchestrator
//!
//! Execution core for agents whose model output is a tag-delimited text
//! stream:
//! - Parses thoughts, outputs and action calls while the stream is arriving
//! - Dispatches action calls as cancellable tasks with retry
//! - Resolves `{{calls.N...}}` and memory templates fail-closed
//! - Degrades malformed outputs and unknown names into diagnostic entries
//! - Keeps a bounded, persisted working memory and an auditable run log
//!
//! STREAM LOOP:
//! CHUNK → ELEMENT → ENTRY → ROUTE → COMMIT → TRIM/PERSIST → NOTIFY

pub mod actions;
pub mod agent;
pub mod audit;
pub mod config;
pub mod error;
pub mod execution;
pub mod inputs;
pub mod memory;
pub mod models;
pub mod outputs;
pub mod parser;
pub mod registry;
pub mod schema;
pub mod state;
pub mod template;

pub use error::{Result, RuntimeError};

// Re-export common types
pub use actions::{Action, ActionCallContext, ActionMemory};
pub use agent::{LogSubscriber, StreamHandler};
pub use audit::{RunLog, RunRecord};
pub use config::{RuntimeConfig, TagConfig};
pub use inputs::Input;
pub use models::*;
pub use outputs::Output;
pub use registry::Catalog;
pub use schema::Schema;
