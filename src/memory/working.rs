//! Working memory for one conversational context
//!
//! Committed entries are appended per category in stream order. The governor
//! is the only thing that removes entries, and it only removes from the front.

use crate::models::{
    ActionCall, ActionResult, EventEntry, InputEntry, LogEntry, OutputEntry, RunEntry, StepEntry,
    Thought,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::trace;

/// Episodes recalled for the most recent input
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EpisodicMemory {
    pub episodes: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkingMemory {
    pub runs: VecDeque<RunEntry>,
    pub steps: VecDeque<StepEntry>,
    pub inputs: VecDeque<InputEntry>,
    pub outputs: VecDeque<OutputEntry>,
    pub calls: VecDeque<ActionCall>,
    pub results: VecDeque<ActionResult>,
    pub events: VecDeque<EventEntry>,
    pub thoughts: VecDeque<Thought>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episodic_memory: Option<EpisodicMemory>,
}

/// Per-category lengths, for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemorySizes {
    pub runs: usize,
    pub steps: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub calls: usize,
    pub results: usize,
    pub events: usize,
    pub thoughts: usize,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a committed entry to its category
    pub fn push(&mut self, entry: LogEntry) {
        trace!(kind = %entry.kind(), id = %entry.id(), "Appending to working memory");
        match entry {
            LogEntry::Run(e) => self.runs.push_back(e),
            LogEntry::Step(e) => self.steps.push_back(e),
            LogEntry::Input(e) => self.inputs.push_back(e),
            LogEntry::Output(e) => self.outputs.push_back(e),
            LogEntry::ActionCall(e) => self.calls.push_back(e),
            LogEntry::ActionResult(e) => self.results.push_back(e),
            LogEntry::Event(e) => self.events.push_back(e),
            LogEntry::Thought(e) => self.thoughts.push_back(e),
        }
    }

    pub fn last_thought(&self) -> Option<&Thought> {
        self.thoughts.back()
    }

    pub fn last_call(&self) -> Option<&ActionCall> {
        self.calls.back()
    }

    pub fn call_mut(&mut self, id: uuid::Uuid) -> Option<&mut ActionCall> {
        self.calls.iter_mut().find(|c| c.header.id == id)
    }

    pub fn sizes(&self) -> MemorySizes {
        MemorySizes {
            runs: self.runs.len(),
            steps: self.steps.len(),
            inputs: self.inputs.len(),
            outputs: self.outputs.len(),
            calls: self.calls.len(),
            results: self.results.len(),
            events: self.events.len(),
            thoughts: self.thoughts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryHeader, EventEntry};
    use serde_json::{json, Map};

    fn thought(content: &str) -> LogEntry {
        LogEntry::Thought(Thought {
            header: EntryHeader::committed(),
            content: content.to_string(),
        })
    }

    #[test]
    fn test_push_routes_by_kind() {
        let mut memory = WorkingMemory::new();
        memory.push(thought("a"));
        memory.push(thought("b"));
        memory.push(LogEntry::Event(EventEntry::new("tick", json!({}), Map::new())));

        let sizes = memory.sizes();
        assert_eq!(sizes.thoughts, 2);
        assert_eq!(sizes.events, 1);
        assert_eq!(memory.last_thought().unwrap().content, "b");
        assert!(memory.last_call().is_none());
    }

    #[test]
    fn test_snapshot_round_trips_through_json() {
        let mut memory = WorkingMemory::new();
        memory.push(thought("persist me"));

        let value = serde_json::to_value(&memory).unwrap();
        assert!(value.get("episodic_memory").is_none());

        let restored: WorkingMemory = serde_json::from_value(value).unwrap();
        assert_eq!(restored, memory);

        let partial: WorkingMemory = serde_json::from_value(json!({ "thoughts": [] })).unwrap();
        assert_eq!(partial.sizes(), MemorySizes::default());
    }
}
