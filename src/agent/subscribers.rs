//! Entry notification fan-out
//!
//! Subscribers see every entry transition, streaming and committed. A
//! subscriber that errors or panics is logged and skipped.

use crate::models::LogEntry;
use crate::Result;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, trace, warn};

pub trait LogSubscriber: Send + Sync {
    fn notify(&self, entry: &LogEntry, done: bool) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogNotification {
    pub entry: LogEntry,
    pub done: bool,
}

#[derive(Default, Clone)]
pub struct SubscriberSet {
    subscribers: Vec<Arc<dyn LogSubscriber>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, subscriber: Arc<dyn LogSubscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn notify(&self, entry: &LogEntry, done: bool) {
        trace!(kind = %entry.kind(), id = %entry.id(), done, "Notifying subscribers");

        for (position, subscriber) in self.subscribers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| subscriber.notify(entry, done))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscriber = position, id = %entry.id(), error = %e, "Subscriber failed");
                }
                Err(_) => {
                    error!(subscriber = position, id = %entry.id(), "Subscriber panicked");
                }
            }
        }
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    notifications: Mutex<Vec<LogNotification>>,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<LogNotification> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Committed entries in notification order
    pub fn committed(&self) -> Vec<LogEntry> {
        self.notifications()
            .into_iter()
            .filter(|n| n.done)
            .map(|n| n.entry)
            .collect()
    }
}

impl LogSubscriber for RecordingSubscriber {
    fn notify(&self, entry: &LogEntry, done: bool) -> Result<()> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(LogNotification {
                entry: entry.clone(),
                done,
            });
        Ok(())
    }
}

/// Republishes notifications on a broadcast channel
pub struct BroadcastSubscriber {
    tx: broadcast::Sender<LogNotification>,
}

impl BroadcastSubscriber {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogNotification> {
        self.tx.subscribe()
    }
}

impl LogSubscriber for BroadcastSubscriber {
    fn notify(&self, entry: &LogEntry, done: bool) -> Result<()> {
        // No receivers is fine
        let _ = self.tx.send(LogNotification {
            entry: entry.clone(),
            done,
        });
        Ok(())
    }
}
