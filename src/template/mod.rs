//! Deferred template resolution
//!
//! A string value that is exactly `{{expr}}` inside a parsed payload is a
//! template. Templates are discovered depth-first in document order and
//! resolved through a [`TemplateResolver`] keyed by the expression's leading
//! identifier. Resolution is fail-closed: one unresolved template fails the
//! whole payload.

use crate::error::RuntimeError;
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

lazy_static! {
    static ref TEMPLATE_PATTERN: Regex =
        Regex::new(r"^\{\{(.*)\}\}$").expect("template pattern is valid");
    static ref PRIMARY_KEY_PATTERN: Regex =
        Regex::new(r"^([a-zA-Z_][a-zA-Z0-9_]*)").expect("primary key pattern is valid");
    static ref PATH_SEPARATOR: Regex = Regex::new(r"[.\[\]]+").expect("path separator is valid");
}

/// One step of a JSON path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{}", k),
            PathSegment::Index(i) => write!(f, "{}", i),
        }
    }
}

fn display_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub path: Vec<PathSegment>,
    pub template_string: String,
    pub expression: String,
    pub primary_key: Option<String>,
}

impl TemplateInfo {
    /// Expression with the primary key and one leading `.` removed
    pub fn value_path(&self) -> Option<&str> {
        let key = self.primary_key.as_deref()?;
        let rest = &self.expression[key.len()..];
        Some(rest.strip_prefix('.').unwrap_or(rest))
    }
}

/// Source of values for template primary keys
#[async_trait::async_trait]
pub trait TemplateResolver: Send + Sync {
    /// `Ok(None)` means the path does not exist
    async fn resolve(&self, primary_key: &str, path: &str) -> Result<Option<Value>>;
}

pub fn detect_templates(value: &Value) -> Vec<TemplateInfo> {
    let mut found = Vec::new();
    let mut path = Vec::new();
    traverse(value, &mut path, &mut found);
    found
}

fn traverse(value: &Value, path: &mut Vec<PathSegment>, found: &mut Vec<TemplateInfo>) {
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                traverse(item, path, found);
                path.pop();
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                path.push(PathSegment::Key(key.clone()));
                traverse(item, path, found);
                path.pop();
            }
        }
        Value::String(s) => {
            if let Some(caps) = TEMPLATE_PATTERN.captures(s) {
                let expression = caps[1].trim().to_string();
                let primary_key = PRIMARY_KEY_PATTERN
                    .captures(&expression)
                    .map(|c| c[1].to_string());

                found.push(TemplateInfo {
                    path: path.clone(),
                    template_string: s.clone(),
                    expression,
                    primary_key,
                });
            }
        }
        _ => {}
    }
}

/// Split `a.b[0].c` into `["a", "b", "0", "c"]`
pub fn get_path_segments(path: &str) -> Vec<String> {
    PATH_SEPARATOR
        .split(path)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn resolve_path_segments<'a, S: AsRef<str>>(
    source: &'a Value,
    segments: &[S],
) -> Option<&'a Value> {
    let mut current = source;

    for segment in segments {
        let segment = segment.as_ref();
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            Value::Object(map) => map.get(segment)?,
            _ => return None,
        };
    }

    Some(current)
}

pub fn get_value_by_path<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(source);
    }
    resolve_path_segments(source, &get_path_segments(path))
}

/// Write `value` at `path`, creating intermediate containers as needed
pub fn set_value_by_path(target: &mut Value, path: &[PathSegment], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *target = value;
        return Ok(());
    };

    let mut current = target;
    for (i, segment) in parents.iter().enumerate() {
        let next_is_index = matches!(path[i + 1], PathSegment::Index(_));
        let slot = child_slot(current, segment, path)?;
        if slot.is_null() {
            *slot = if next_is_index {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            };
        }
        current = slot;
    }

    *child_slot(current, last, path)? = value;
    Ok(())
}

fn child_slot<'a>(
    parent: &'a mut Value,
    segment: &PathSegment,
    full_path: &[PathSegment],
) -> Result<&'a mut Value> {
    match (parent, segment) {
        (Value::Object(map), PathSegment::Key(key)) => Ok(map.entry(key.clone()).or_insert(Value::Null)),
        (Value::Array(items), PathSegment::Index(i)) => {
            if *i >= items.len() {
                items.resize(*i + 1, Value::Null);
            }
            Ok(&mut items[*i])
        }
        _ => Err(RuntimeError::TemplateResolution(format!(
            "cannot set {} beyond a non-container value",
            display_path(full_path)
        ))),
    }
}

/// Resolve every template in discovery order, writing results back in place
pub async fn resolve_templates(
    payload: &mut Value,
    templates: &[TemplateInfo],
    resolver: &dyn TemplateResolver,
) -> Result<()> {
    for template in templates {
        let location = display_path(&template.path);

        let (Some(primary_key), Some(value_path)) =
            (template.primary_key.as_deref(), template.value_path())
        else {
            warn!(path = %location, template = %template.template_string, "Template has no primary key");
            return Err(RuntimeError::TemplateResolution(format!(
                "template {} at {} has no primary key",
                template.template_string, location
            )));
        };

        let resolved = match resolver.resolve(primary_key, value_path).await {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %location, error = %e, "Template resolver failed");
                None
            }
        };

        let Some(value) = resolved else {
            return Err(RuntimeError::TemplateResolution(format!(
                "could not resolve template {} at {}",
                template.template_string, location
            )));
        };

        debug!(path = %location, primary_key, "Template resolved");
        set_value_by_path(payload, &template.path, value)?;
    }

    Ok(())
}
