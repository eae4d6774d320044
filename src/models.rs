//! Core data models for the execution log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Thought,
    Input,
    Output,
    ActionCall,
    ActionResult,
    Event,
    Step,
    Run,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryKind::Thought => "thought",
            EntryKind::Input => "input",
            EntryKind::Output => "output",
            EntryKind::ActionCall => "action_call",
            EntryKind::ActionResult => "action_result",
            EntryKind::Event => "event",
            EntryKind::Step => "step",
            EntryKind::Run => "run",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Header =================
//

/// Fields shared by every log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryHeader {
    pub id: Uuid,
    /// Parser element index; `None` for entries synthesized by the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub processed: bool,
}

impl EntryHeader {
    pub fn new(index: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            timestamp: Utc::now(),
            done: false,
            processed: false,
        }
    }

    /// Header for an entry that is final on creation
    pub fn committed() -> Self {
        Self {
            done: true,
            ..Self::new(None)
        }
    }
}

//
// ================= Entries =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thought {
    #[serde(flatten)]
    pub header: EntryHeader,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputEntry {
    #[serde(flatten)]
    pub header: EntryHeader,
    #[serde(rename = "type")]
    pub input_type: String,
    pub content: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub formatted: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputEntry {
    #[serde(flatten)]
    pub header: EntryHeader,
    #[serde(rename = "type")]
    pub output_type: String,
    pub content: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub formatted: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionCall {
    #[serde(flatten)]
    pub header: EntryHeader,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    #[serde(flatten)]
    pub header: EntryHeader,
    pub call_id: Uuid,
    pub name: String,
    pub data: Value,
    #[serde(default)]
    pub formatted: Option<String>,
}

impl ActionResult {
    pub fn new(call: &ActionCall, data: Value) -> Self {
        Self {
            header: EntryHeader::committed(),
            call_id: call.header.id,
            name: call.name.clone(),
            data,
            formatted: None,
        }
    }

    /// Result recorded when the handler failed without recovery
    pub fn captured_error(call: &ActionCall, error: impl fmt::Display) -> Self {
        Self::new(call, serde_json::json!({ "error": error.to_string() }))
    }

    pub fn is_error(&self) -> bool {
        self.data.get("error").is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEntry {
    #[serde(flatten)]
    pub header: EntryHeader,
    pub name: String,
    pub data: Value,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl EventEntry {
    pub fn new(name: impl Into<String>, data: Value, params: Map<String, Value>) -> Self {
        Self {
            header: EntryHeader::committed(),
            name: name.into(),
            data,
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepEntry {
    #[serde(flatten)]
    pub header: EntryHeader,
    pub step: u32,
    #[serde(rename = "type")]
    pub step_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEntry {
    #[serde(flatten)]
    pub header: EntryHeader,
    #[serde(rename = "type")]
    pub context_type: String,
}

/// A classified, index-addressed unit of the execution log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "ref", rename_all = "snake_case")]
pub enum LogEntry {
    Thought(Thought),
    Input(InputEntry),
    Output(OutputEntry),
    ActionCall(ActionCall),
    ActionResult(ActionResult),
    Event(EventEntry),
    Step(StepEntry),
    Run(RunEntry),
}

impl LogEntry {
    /// Empty streaming entry of the given kind for a parser element
    pub fn streaming(kind: EntryKind, index: u64) -> Self {
        let header = EntryHeader::new(Some(index));
        match kind {
            EntryKind::Thought => LogEntry::Thought(Thought {
                header,
                content: String::new(),
            }),
            EntryKind::Input => LogEntry::Input(InputEntry {
                header,
                input_type: String::new(),
                content: String::new(),
                data: None,
                params: Map::new(),
                formatted: None,
            }),
            EntryKind::Output => LogEntry::Output(OutputEntry {
                header,
                output_type: String::new(),
                content: String::new(),
                data: None,
                params: Map::new(),
                formatted: None,
            }),
            EntryKind::ActionCall => LogEntry::ActionCall(ActionCall {
                header,
                name: String::new(),
                content: String::new(),
                data: None,
                params: Map::new(),
            }),
            EntryKind::ActionResult => LogEntry::ActionResult(ActionResult {
                header,
                call_id: Uuid::nil(),
                name: String::new(),
                data: Value::Null,
                formatted: None,
            }),
            EntryKind::Event => LogEntry::Event(EventEntry {
                header,
                name: String::new(),
                data: Value::Null,
                params: Map::new(),
            }),
            EntryKind::Step => LogEntry::Step(StepEntry {
                header,
                step: 0,
                step_type: String::new(),
            }),
            EntryKind::Run => LogEntry::Run(RunEntry {
                header,
                context_type: String::new(),
            }),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            LogEntry::Thought(_) => EntryKind::Thought,
            LogEntry::Input(_) => EntryKind::Input,
            LogEntry::Output(_) => EntryKind::Output,
            LogEntry::ActionCall(_) => EntryKind::ActionCall,
            LogEntry::ActionResult(_) => EntryKind::ActionResult,
            LogEntry::Event(_) => EntryKind::Event,
            LogEntry::Step(_) => EntryKind::Step,
            LogEntry::Run(_) => EntryKind::Run,
        }
    }

    pub fn header(&self) -> &EntryHeader {
        match self {
            LogEntry::Thought(e) => &e.header,
            LogEntry::Input(e) => &e.header,
            LogEntry::Output(e) => &e.header,
            LogEntry::ActionCall(e) => &e.header,
            LogEntry::ActionResult(e) => &e.header,
            LogEntry::Event(e) => &e.header,
            LogEntry::Step(e) => &e.header,
            LogEntry::Run(e) => &e.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut EntryHeader {
        match self {
            LogEntry::Thought(e) => &mut e.header,
            LogEntry::Input(e) => &mut e.header,
            LogEntry::Output(e) => &mut e.header,
            LogEntry::ActionCall(e) => &mut e.header,
            LogEntry::ActionResult(e) => &mut e.header,
            LogEntry::Event(e) => &mut e.header,
            LogEntry::Step(e) => &mut e.header,
            LogEntry::Run(e) => &mut e.header,
        }
    }

    pub fn id(&self) -> Uuid {
        self.header().id
    }

    pub fn is_done(&self) -> bool {
        self.header().done
    }

    /// Name-like identifier used in diagnostics (action name, output/input type, event name)
    pub fn name(&self) -> Option<&str> {
        let name = match self {
            LogEntry::Input(e) => e.input_type.as_str(),
            LogEntry::Output(e) => e.output_type.as_str(),
            LogEntry::ActionCall(e) => e.name.as_str(),
            LogEntry::ActionResult(e) => e.name.as_str(),
            LogEntry::Event(e) => e.name.as_str(),
            LogEntry::Step(e) => e.step_type.as_str(),
            LogEntry::Run(e) => e.context_type.as_str(),
            LogEntry::Thought(_) => return None,
        };

        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// Raw streamed text, for kinds that carry it
    pub fn content(&self) -> Option<&str> {
        match self {
            LogEntry::Thought(e) => Some(&e.content),
            LogEntry::Input(e) => Some(&e.content),
            LogEntry::Output(e) => Some(&e.content),
            LogEntry::ActionCall(e) => Some(&e.content),
            _ => None,
        }
    }
}

//
// ================= Context =================
//

/// Live state of one conversational context participating in a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextState {
    pub id: String,
    #[serde(rename = "type")]
    pub context_type: String,
    #[serde(default)]
    pub memory: Value,
}

impl ContextState {
    pub fn new(id: impl Into<String>, context_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context_type: context_type.into(),
            memory: Value::Object(Map::new()),
        }
    }

    pub fn with_memory(mut self, memory: Value) -> Self {
        self.memory = memory;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serializes_with_ref_tag() {
        let event = LogEntry::Event(EventEntry::new(
            "error:action_call",
            serde_json::json!({ "error": "ActionNameNotFound" }),
            Map::new(),
        ));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["ref"], "event");
        assert_eq!(value["name"], "error:action_call");
        assert_eq!(value["done"], true);
    }

    #[test]
    fn test_streaming_entry_starts_open() {
        let entry = LogEntry::streaming(EntryKind::ActionCall, 7);
        assert_eq!(entry.kind(), EntryKind::ActionCall);
        assert_eq!(entry.header().index, Some(7));
        assert!(!entry.is_done());
        assert_eq!(entry.name(), None);
    }

    #[test]
    fn test_captured_error_result() {
        let call = ActionCall {
            header: EntryHeader::committed(),
            name: "openOrder".to_string(),
            content: "{}".to_string(),
            data: None,
            params: Map::new(),
        };

        let result = ActionResult::captured_error(&call, "exchange offline");
        assert!(result.is_error());
        assert_eq!(result.call_id, call.header.id);
        assert_eq!(result.data["error"], "exchange offline");
    }
}
