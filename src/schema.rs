//! Payload schemas
//!
//! A closed description of the JSON shape an action, output or input accepts.
//! Validation returns the normalized payload: defaults applied, unknown object
//! keys dropped.

use crate::error::RuntimeError;
use crate::Result;
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Enum(Vec<String>),
    Array(Box<Schema>),
    Object(Vec<(String, Schema)>),
    Optional(Box<Schema>),
    Default(Box<Schema>, Value),
}

impl Schema {
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Schema)>,
        K: Into<String>,
    {
        Schema::Object(fields.into_iter().map(|(k, s)| (k.into(), s)).collect())
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array(Box::new(items))
    }

    pub fn enumeration<I, S>(variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Schema::Enum(variants.into_iter().map(Into::into).collect())
    }

    pub fn optional(self) -> Self {
        Schema::Optional(Box::new(self))
    }

    pub fn with_default(self, value: Value) -> Self {
        Schema::Default(Box::new(self), value)
    }

    /// Plain strings are taken verbatim and never JSON-decoded
    pub fn is_string(&self) -> bool {
        match self {
            Schema::String => true,
            Schema::Optional(inner) | Schema::Default(inner, _) => inner.is_string(),
            _ => false,
        }
    }

    pub fn validate(&self, value: &Value) -> Result<Value> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<Value> {
        match self {
            Schema::Any => Ok(value.clone()),
            Schema::String => match value {
                Value::String(_) => Ok(value.clone()),
                other => Err(mismatch(path, "string", other)),
            },
            Schema::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                other => Err(mismatch(path, "number", other)),
            },
            Schema::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                other => Err(mismatch(path, "integer", other)),
            },
            Schema::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                other => Err(mismatch(path, "boolean", other)),
            },
            Schema::Enum(variants) => match value {
                Value::String(s) if variants.iter().any(|v| v == s) => Ok(value.clone()),
                other => Err(RuntimeError::Schema(format!(
                    "{}: expected one of [{}], got {}",
                    path,
                    variants.join(", "),
                    other
                ))),
            },
            Schema::Array(items) => match value {
                Value::Array(values) => values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| items.validate_at(v, &format!("{}[{}]", path, i)))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array),
                other => Err(mismatch(path, "array", other)),
            },
            Schema::Object(fields) => {
                let Value::Object(map) = value else {
                    return Err(mismatch(path, "object", value));
                };

                let mut out = Map::with_capacity(fields.len());
                for (key, schema) in fields {
                    let field_path = format!("{}.{}", path, key);
                    match map.get(key) {
                        Some(v) => {
                            out.insert(key.clone(), schema.validate_at(v, &field_path)?);
                        }
                        None => {
                            if let Some(v) = schema.missing_value(&field_path)? {
                                out.insert(key.clone(), v);
                            }
                        }
                    }
                }
                Ok(Value::Object(out))
            }
            Schema::Optional(inner) => match value {
                Value::Null => Ok(Value::Null),
                v => inner.validate_at(v, path),
            },
            Schema::Default(inner, default) => match value {
                Value::Null => Ok(default.clone()),
                v => inner.validate_at(v, path),
            },
        }
    }

    /// Value used when an object field is absent; `None` leaves it out
    fn missing_value(&self, path: &str) -> Result<Option<Value>> {
        match self {
            Schema::Optional(_) | Schema::Any => Ok(None),
            Schema::Default(_, default) => Ok(Some(default.clone())),
            _ => Err(RuntimeError::Schema(format!("{}: required", path))),
        }
    }

    /// Smallest payload of this shape: empty strings, zeros, required fields only
    pub fn empty_value(&self) -> Value {
        match self {
            Schema::Any | Schema::Optional(_) => Value::Null,
            Schema::String => Value::String(String::new()),
            Schema::Number | Schema::Integer => Value::Number(Number::from(0)),
            Schema::Boolean => Value::Bool(false),
            Schema::Enum(variants) => variants
                .first()
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null),
            Schema::Array(_) => Value::Array(Vec::new()),
            Schema::Object(fields) => Value::Object(
                fields
                    .iter()
                    .filter(|(_, s)| !matches!(s, Schema::Optional(_) | Schema::Any))
                    .map(|(k, s)| (k.clone(), s.empty_value()))
                    .collect(),
            ),
            Schema::Default(_, default) => default.clone(),
        }
    }
}

fn mismatch(path: &str, expected: &str, got: &Value) -> RuntimeError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    RuntimeError::Schema(format!("{}: expected {}, got {}", path, expected, got))
}
