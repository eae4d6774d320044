//! Working memory retention
//!
//! Bounds every working-memory category and persists the trimmed snapshot.

use crate::memory::working::WorkingMemory;
use crate::state::MemoryStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Retention caps per working-memory category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_runs: usize,
    pub max_inputs: usize,
    pub max_outputs: usize,
    pub max_calls: usize,
    pub max_results: usize,
    pub max_events: usize,
    pub max_thoughts: usize,
    /// Steps are per-tick scratch and dropped on every pass
    pub clear_steps: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_runs: 3,
            max_inputs: 1,
            max_outputs: 1,
            max_calls: 5,
            max_results: 5,
            max_events: 3,
            max_thoughts: 50,
            clear_steps: true,
        }
    }
}

/// Drop the oldest elements until at most `max` remain
fn trim_front<T>(items: &mut VecDeque<T>, max: usize) -> usize {
    let excess = items.len().saturating_sub(max);
    items.drain(..excess);
    excess
}

pub struct MemoryGovernor {
    config: RetentionConfig,
    store: Arc<dyn MemoryStore>,
}

impl MemoryGovernor {
    pub fn new(config: RetentionConfig, store: Arc<dyn MemoryStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Apply retention caps; returns how many entries were dropped
    pub fn trim(&self, memory: &mut WorkingMemory) -> usize {
        let c = &self.config;
        let mut dropped = 0;

        if c.clear_steps {
            dropped += memory.steps.len();
            memory.steps.clear();
        }
        dropped += trim_front(&mut memory.runs, c.max_runs);
        dropped += trim_front(&mut memory.inputs, c.max_inputs);
        dropped += trim_front(&mut memory.outputs, c.max_outputs);
        dropped += trim_front(&mut memory.calls, c.max_calls);
        dropped += trim_front(&mut memory.results, c.max_results);
        dropped += trim_front(&mut memory.events, c.max_events);
        dropped += trim_front(&mut memory.thoughts, c.max_thoughts);

        debug!(dropped, sizes = ?memory.sizes(), "Working memory size after limiting");
        dropped
    }

    /// Trim, then persist the snapshot under `key`
    pub async fn commit(&self, key: &str, memory: &mut WorkingMemory) -> Result<()> {
        self.trim(memory);
        self.store.set(key, serde_json::to_value(&*memory)?).await
    }

    /// Load a persisted snapshot, or start empty
    pub async fn load(&self, key: &str) -> Result<WorkingMemory> {
        match self.store.get(key).await? {
            Some(value) => {
                let memory: WorkingMemory = serde_json::from_value(value)?;
                info!(key, sizes = ?memory.sizes(), "Loaded working memory");
                Ok(memory)
            }
            None => Ok(WorkingMemory::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryHeader, LogEntry, StepEntry, Thought};
    use crate::state::InMemoryMemoryStore;

    fn thought(n: usize) -> LogEntry {
        LogEntry::Thought(Thought {
            header: EntryHeader::committed(),
            content: format!("t{}", n),
        })
    }

    fn governor(config: RetentionConfig) -> (MemoryGovernor, Arc<InMemoryMemoryStore>) {
        let store = Arc::new(InMemoryMemoryStore::new());
        (MemoryGovernor::new(config, store.clone()), store)
    }

    #[test]
    fn test_trim_keeps_contiguous_suffix() {
        let (governor, _) = governor(RetentionConfig {
            max_thoughts: 4,
            ..RetentionConfig::default()
        });

        for total in 0..12 {
            let mut memory = WorkingMemory::new();
            for n in 0..total {
                memory.push(thought(n));
            }
            let before: Vec<String> = memory.thoughts.iter().map(|t| t.content.clone()).collect();

            governor.trim(&mut memory);

            let after: Vec<String> = memory.thoughts.iter().map(|t| t.content.clone()).collect();
            assert!(after.len() <= 4);
            assert!(before.ends_with(&after), "{:?} is not a suffix of {:?}", after, before);
            assert_eq!(after.len(), before.len().min(4));
        }
    }

    #[test]
    fn test_steps_cleared_on_every_pass() {
        let (governor, _) = governor(RetentionConfig::default());
        let mut memory = WorkingMemory::new();
        memory.push(LogEntry::Step(StepEntry {
            header: EntryHeader::committed(),
            step: 1,
            step_type: "stream".to_string(),
        }));

        assert_eq!(governor.trim(&mut memory), 1);
        assert!(memory.steps.is_empty());
    }

    #[tokio::test]
    async fn test_commit_persists_trimmed_snapshot() {
        let (governor, store) = governor(RetentionConfig {
            max_thoughts: 2,
            ..RetentionConfig::default()
        });
        let mut memory = WorkingMemory::new();
        for n in 0..5 {
            memory.push(thought(n));
        }

        governor.commit("working-memory:ctx-1", &mut memory).await.unwrap();

        let stored = store.get("working-memory:ctx-1").await.unwrap().unwrap();
        assert_eq!(stored["thoughts"].as_array().unwrap().len(), 2);
        assert_eq!(stored["thoughts"][0]["content"], "t3");

        let loaded = governor.load("working-memory:ctx-1").await.unwrap();
        assert_eq!(loaded, memory);
        assert_eq!(governor.load("missing").await.unwrap(), WorkingMemory::new());
    }
}
