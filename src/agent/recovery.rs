//! Degrading lookup and payload errors into diagnostic entries

use crate::error::RuntimeError;
use crate::models::{EntryHeader, EventEntry, LogEntry, OutputEntry};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

pub const OUTPUT_ERROR_EVENT: &str = "error:output";
pub const OUTPUT_PARSING_ERROR_EVENT: &str = "error:output:parsingError";
pub const ACTION_CALL_ERROR_EVENT: &str = "error:action_call";
pub const ACTION_CALL_PARSING_ERROR_EVENT: &str = "error:action_call:parsingError";

fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn degraded_output(mut entry: OutputEntry, error: &str) -> OutputEntry {
    entry
        .params
        .insert("id".to_string(), json!(entry.header.id.to_string()));
    entry.params.insert("error".to_string(), json!(error));
    entry.header.done = true;
    entry.header.processed = false;
    entry
}

fn event(name: &str, data: Value, params: Map<String, Value>) -> LogEntry {
    LogEntry::Event(EventEntry {
        header: EntryHeader {
            processed: true,
            ..EntryHeader::committed()
        },
        name: name.to_string(),
        data,
        params,
    })
}

/// Entries to commit in place of a failed entry.
///
/// Inputs and non-recoverable errors produce nothing.
pub fn recover(error: &RuntimeError) -> Vec<LogEntry> {
    match error {
        RuntimeError::NotFound { entry } => match entry.as_ref() {
            LogEntry::Output(output) => {
                let output_id = output.header.id.to_string();
                let event = event(
                    OUTPUT_ERROR_EVENT,
                    json!({ "error": "OutputTypeNotFound", "type": output.output_type }),
                    params(&[("outputId", json!(output_id))]),
                );
                vec![
                    LogEntry::Output(degraded_output(output.clone(), "OutputTypeNotFound")),
                    event,
                ]
            }
            LogEntry::ActionCall(call) => vec![event(
                ACTION_CALL_ERROR_EVENT,
                json!({ "error": "ActionNameNotFound", "name": call.name }),
                params(&[("callId", json!(call.header.id.to_string()))]),
            )],
            other => {
                debug!(kind = %other.kind(), "Dropping lookup error");
                Vec::new()
            }
        },
        RuntimeError::Parsing { entry, message } => match entry.as_ref() {
            LogEntry::Output(output) => {
                let output_id = output.header.id.to_string();
                let event = event(
                    OUTPUT_PARSING_ERROR_EVENT,
                    json!({ "message": message }),
                    params(&[("outputId", json!(output_id))]),
                );
                vec![
                    LogEntry::Output(degraded_output(output.clone(), "parsingError")),
                    event,
                ]
            }
            LogEntry::ActionCall(call) => vec![event(
                ACTION_CALL_PARSING_ERROR_EVENT,
                json!({ "message": message }),
                params(&[("callId", json!(call.header.id.to_string()))]),
            )],
            other => {
                debug!(kind = %other.kind(), "Dropping parsing error");
                Vec::new()
            }
        },
        other => {
            warn!(error = %other, "Error has no recovery entries");
            Vec::new()
        }
    }
}

/// Entries to commit when an output's handler itself fails
pub fn recover_output_handler(output: &OutputEntry, error: &RuntimeError) -> Vec<LogEntry> {
    let event = event(
        OUTPUT_ERROR_EVENT,
        json!({ "error": "handlerError", "message": error.to_string() }),
        params(&[("outputId", json!(output.header.id.to_string()))]),
    );
    vec![
        LogEntry::Output(degraded_output(output.clone(), "handlerError")),
        event,
    ]
}
