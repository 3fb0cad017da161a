use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::host::Host;

/// Where a configuration value applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Host(String),
}

/// Process-wide key/value settings with per-host overrides.
///
/// Lookups for a host resolve the host-scoped value first, then the host's
/// own attributes, then the global value.
#[derive(Debug, Default, Clone)]
pub struct ConfigStore {
    global: HashMap<String, Value>,
    scoped: HashMap<String, HashMap<String, Value>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write for a key and scope wins.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>, scope: Scope) {
        let key = key.into();
        let value = value.into();
        match scope {
            Scope::Global => {
                self.global.insert(key, value);
            }
            Scope::Host(host) => {
                self.scoped.entry(host).or_default().insert(key, value);
            }
        }
    }

    pub fn set_global(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.set(key, value, Scope::Global);
    }

    fn lookup<'a>(&'a self, key: &str, host: Option<&'a Host>) -> Option<&'a Value> {
        if let Some(host) = host {
            if let Some(value) = self.scoped.get(host.name()).and_then(|m| m.get(key)) {
                return Some(value);
            }
            if let Some(value) = host.attribute(key) {
                return Some(value);
            }
        }
        self.global.get(key)
    }

    pub fn get<'a>(&'a self, key: &str, host: Option<&'a Host>) -> Result<&'a Value> {
        self.lookup(key, host)
            .ok_or_else(|| Error::config_missing_key(key, host.map(|h| h.name().to_string())))
    }

    pub fn get_or(&self, key: &str, host: Option<&Host>, default: Value) -> Value {
        self.lookup(key, host).cloned().unwrap_or(default)
    }

    pub fn contains(&self, key: &str, host: Option<&Host>) -> bool {
        self.lookup(key, host).is_some()
    }

    pub fn get_str(&self, key: &str, host: Option<&Host>) -> Result<String> {
        Ok(value_to_string(self.get(key, host)?))
    }

    pub fn get_u64(&self, key: &str, host: Option<&Host>) -> Result<u64> {
        let value = self.get(key, host)?;
        value_to_u64(value).ok_or_else(|| {
            Error::config_invalid_value(key, Some(value_to_string(value)), "Expected a number")
        })
    }

    pub fn get_bool(&self, key: &str, host: Option<&Host>) -> Result<bool> {
        let value = self.get(key, host)?;
        match value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) if s == "true" || s == "yes" || s == "1" => Ok(true),
            Value::String(s) if s == "false" || s == "no" || s == "0" => Ok(false),
            other => Err(Error::config_invalid_value(
                key,
                Some(value_to_string(other)),
                "Expected a boolean",
            )),
        }
    }

    /// A list value, or a whitespace-separated string. Missing keys yield an
    /// empty list.
    pub fn get_list(&self, key: &str, host: Option<&Host>) -> Vec<String> {
        match self.lookup(key, host) {
            Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![value_to_string(other)],
        }
    }
}

/// Render a value the way templates see it.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(_) => value.to_string(),
    }
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
