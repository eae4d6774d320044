//! Error types for the stream execution runtime

use crate::models::LogEntry;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {

    // =============================
    // Recoverable entry errors
    // =============================

    #[error("{} not found: {}", .entry.kind(), .entry.name().unwrap_or("undefined"))]
    NotFound { entry: Box<LogEntry> },

    #[error("Parsing error for {}: {message}", .entry.kind())]
    Parsing {
        entry: Box<LogEntry>,
        message: String,
    },

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Template resolution error: {0}")]
    TemplateResolution(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error("Run aborted")]
    Aborted,

    #[error("Schema violation: {0}")]
    Schema(String),

    #[error("Invalid registry: {0}")]
    InvalidRegistry(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn not_found(entry: LogEntry) -> Self {
        Self::NotFound {
            entry: Box::new(entry),
        }
    }

    pub fn parsing(entry: LogEntry, message: impl Into<String>) -> Self {
        Self::Parsing {
            entry: Box::new(entry),
            message: message.into(),
        }
    }

    /// Entry carried by lookup and payload errors
    pub fn entry(&self) -> Option<&LogEntry> {
        match self {
            Self::NotFound { entry } | Self::Parsing { entry, .. } => Some(entry),
            _ => None,
        }
    }

    /// Lookup and payload errors degrade into diagnostic entries
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Parsing { .. })
    }
}
