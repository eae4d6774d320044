//! Runtime configuration
//!
//! Threaded explicitly through the stream handler; there is no process-wide
//! configuration store.

use crate::error::RuntimeError;
use crate::memory::RetentionConfig;
use crate::models::EntryKind;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use tracing::{debug, warn};

/// How a recognized tag behaves in the stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagConfig {
    pub name: String,
    /// Entry kind the element is promoted to; `None` for pure wrappers
    #[serde(default)]
    pub kind: Option<EntryKind>,
    /// Same-tag opens nest under the open element instead of being literal text
    #[serde(default)]
    pub reentrant: bool,
    /// Recognized child tags are parsed while this element is open
    #[serde(default)]
    pub container: bool,
}

impl TagConfig {
    pub fn new(name: impl Into<String>, kind: Option<EntryKind>) -> Self {
        Self {
            name: name.into(),
            kind,
            reentrant: false,
            container: false,
        }
    }

    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    pub fn container(mut self) -> Self {
        self.container = true;
        self
    }
}

fn default_tags() -> Vec<TagConfig> {
    vec![
        TagConfig::new("think", Some(EntryKind::Thought)),
        TagConfig::new("thinking", Some(EntryKind::Thought)).reentrant(),
        TagConfig::new("reasoning", Some(EntryKind::Thought)),
        TagConfig::new("response", None).container(),
        TagConfig::new("output", Some(EntryKind::Output)).reentrant(),
        TagConfig::new("action_call", Some(EntryKind::ActionCall)).reentrant(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub tags: Vec<TagConfig>,
    pub retention: RetentionConfig,
    /// Upper bound on concurrently executing action tasks
    pub max_concurrent_tasks: usize,
    /// Retry count for actions that do not declare their own
    pub default_retry: u32,
    /// Base delay between retry attempts, doubled per attempt
    pub retry_delay_ms: u64,
    /// Context type whose memory backs `{{shortTermMemory...}}` templates
    pub short_term_memory_context: String,
    pub working_memory_key_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tags: default_tags(),
            retention: RetentionConfig::default(),
            max_concurrent_tasks: 8,
            default_retry: 0,
            retry_delay_ms: 250,
            short_term_memory_context: "shortTermMemory".to_string(),
            working_memory_key_prefix: "working-memory".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `AGENT_*` environment variables (`.env` honored)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("AGENT_MAX_CONCURRENT_TASKS")? {
            config.max_concurrent_tasks = v;
        }
        if let Some(v) = env_parse::<u32>("AGENT_DEFAULT_RETRY")? {
            config.default_retry = v;
        }
        if let Some(v) = env_parse::<u64>("AGENT_RETRY_DELAY_MS")? {
            config.retry_delay_ms = v;
        }
        if let Ok(v) = env::var("AGENT_SHORT_TERM_MEMORY_CONTEXT") {
            config.short_term_memory_context = v;
        }
        if let Ok(v) = env::var("AGENT_WORKING_MEMORY_KEY_PREFIX") {
            config.working_memory_key_prefix = v;
        }
        if let Some(v) = env_parse::<usize>("AGENT_MAX_THOUGHTS")? {
            config.retention.max_thoughts = v;
        }
        if let Some(v) = env_parse::<usize>("AGENT_MAX_CALLS")? {
            config.retention.max_calls = v;
            config.retention.max_results = v;
        }

        config.validate()?;
        debug!(?config, "Runtime configuration loaded from environment");
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.tags.len());
        for tag in &self.tags {
            if tag.name.trim().is_empty() {
                return Err(RuntimeError::InvalidConfig(
                    "tag names must not be empty".to_string(),
                ));
            }
            if !seen.insert(tag.name.as_str()) {
                return Err(RuntimeError::InvalidConfig(format!(
                    "duplicate tag: {}",
                    tag.name
                )));
            }
        }

        Ok(())
    }

    pub fn tag(&self, name: &str) -> Option<&TagConfig> {
        self.tags.iter().find(|t| t.name == name)
    }

    pub fn tag_names(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn working_memory_key(&self, context_id: &str) -> String {
        format!("{}:{}", self.working_memory_key_prefix, context_id)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            warn!(key, value = %raw, "Unparseable environment override");
            RuntimeError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vocabulary() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());

        let response = config.tag("response").unwrap();
        assert!(response.container);
        assert!(!response.reentrant);
        assert_eq!(response.kind, None);

        let output = config.tag("output").unwrap();
        assert!(output.reentrant);
        assert_eq!(output.kind, Some(EntryKind::Output));

        assert!(!config.tag("think").unwrap().reentrant);
    }

    #[test]
    fn test_rejects_duplicate_tags() {
        let mut config = RuntimeConfig::default();
        config.tags.push(TagConfig::new("output", Some(EntryKind::Output)));
        assert!(matches!(
            config.validate(),
            Err(RuntimeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_json_merges_defaults() {
        let config = RuntimeConfig::from_json_str(
            r#"{ "max_concurrent_tasks": 2, "retention": { "max_thoughts": 10 } }"#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.retention.max_thoughts, 10);
        assert_eq!(config.retention.max_runs, 3);
        assert_eq!(config.tags.len(), 6);
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        let result = RuntimeConfig::from_json_str(r#"{ "max_concurrent_tasks": 0 }"#);
        assert!(result.is_err());
    }
}
