//! Index-addressed store of streaming entries
//!
//! Only elements still being parsed live here; the handler removes each one
//! once it is routed.

use crate::models::{EntryKind, LogEntry};
use std::collections::HashMap;
use tracing::{trace, warn};

#[derive(Debug, Default)]
pub struct LogEntryStore {
    by_index: HashMap<u64, LogEntry>,
    max: Option<u64>,
}

impl LogEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `index`, created on first sight.
    ///
    /// The index keeps its entry (and id) for the life of the element, so
    /// repeated calls never replace it.
    pub fn get_or_create(&mut self, index: u64, kind: EntryKind) -> &mut LogEntry {
        self.max = Some(self.max.map_or(index, |m| m.max(index)));

        let entry = self.by_index.entry(index).or_insert_with(|| {
            trace!(index, %kind, "Creating log entry");
            LogEntry::streaming(kind, index)
        });

        if entry.kind() != kind {
            warn!(index, existing = %entry.kind(), requested = %kind, "Index reused with a different kind");
        }
        entry
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.by_index.get(&index)
    }

    /// Forget a finalized entry. The index stays reserved for `next_index`.
    pub fn remove(&mut self, index: u64) -> Option<LogEntry> {
        self.by_index.remove(&index)
    }

    /// First index a new parser should hand out
    pub fn next_index(&self) -> u64 {
        self.max.map_or(0, |m| m + 1)
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}
