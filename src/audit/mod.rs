//! Run audit log and replay
//!
//! Every finished run is recorded with a hash of its committed chain so the
//! record can be verified and replayed later.

use crate::error::RuntimeError;
use crate::memory::{MemoryGovernor, WorkingMemory};
use crate::models::LogEntry;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// A finished run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// Id of the run's `Run` entry
    pub run_id: Uuid,
    pub context_id: String,
    pub context_type: String,
    pub chain: Vec<LogEntry>,
    pub errors: Vec<String>,
    pub steps: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub chain_hash: String,
}

/// Audit trail storage
pub struct RunLog {
    records: Arc<RwLock<HashMap<Uuid, RunRecord>>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record(&self, record: RunRecord) -> Result<Uuid> {
        let run_id = record.run_id;
        let mut records = self.records.write().await;
        records.insert(run_id, record);
        Ok(run_id)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&run_id).cloned())
    }

    /// Run ids for a context, oldest first
    pub async fn list_for_context(&self, context_id: &str) -> Result<Vec<Uuid>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .values()
            .filter(|r| r.context_id == context_id)
            .map(|r| (r.run_id, r.started_at))
            .collect();

        items.sort_by_key(|(_, started_at)| *started_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }

    /// Verify a record's chain against its stored hash
    pub async fn verify_integrity(&self, run_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;

        match records.get(&run_id) {
            Some(record) => Ok(compute_chain_hash(&record.chain) == record.chain_hash),
            None => Ok(false),
        }
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 of the chain's JSON serialization
pub fn compute_chain_hash(chain: &[LogEntry]) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), chain).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Rebuild the working memory a run's committed chain produces.
///
/// Fails if the stored chain no longer matches its hash.
pub async fn replay_run(
    log: &RunLog,
    run_id: Uuid,
    governor: &MemoryGovernor,
) -> Result<Option<WorkingMemory>> {
    let Some(record) = log.get(run_id).await? else {
        return Ok(None);
    };

    if compute_chain_hash(&record.chain) != record.chain_hash {
        warn!(%run_id, "Run chain failed integrity check");
        return Err(RuntimeError::Store(format!(
            "run {} failed integrity verification",
            run_id
        )));
    }

    let mut memory = WorkingMemory::new();
    for entry in record.chain {
        memory.push(entry);
        governor.trim(&mut memory);
    }
    Ok(Some(memory))
}
