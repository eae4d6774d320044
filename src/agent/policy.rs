//! When to run another step

use crate::models::{EntryKind, LogEntry};

/// Decides whether the host should run another step
pub trait ContinuePolicy: Send + Sync {
    fn should_continue(&self, chain: &[LogEntry], errors: &[String]) -> bool;
}

/// Continue while the latest step issued at least one action call
#[derive(Debug, Default, Clone, Copy)]
pub struct ContinueOnActionCalls;

impl ContinuePolicy for ContinueOnActionCalls {
    fn should_continue(&self, chain: &[LogEntry], _errors: &[String]) -> bool {
        chain
            .iter()
            .rev()
            .take_while(|e| e.kind() != EntryKind::Step)
            .any(|e| e.kind() == EntryKind::ActionCall)
    }
}
