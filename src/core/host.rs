use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::utils::suggest;

pub type HostAttributes = BTreeMap<String, Value>;

/// Well-known host attribute keys.
pub struct HostKeys;

impl HostKeys {
    pub const HOSTNAME: &'static str = "hostname";
    pub const REMOTE_USER: &'static str = "remote_user";
    pub const PORT: &'static str = "port";
    pub const IDENTITY_FILE: &'static str = "identity_file";
    pub const DEPLOY_PATH: &'static str = "deploy_path";
}

const DEFAULT_PORT: u16 = 22;

/// A declared deploy target. Immutable once registered.
#[derive(Debug, Clone, Serialize)]
pub struct Host {
    name: String,
    attributes: HostAttributes,
}

impl Host {
    fn new(name: String, attributes: HostAttributes) -> Self {
        Self { name, attributes }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &HostAttributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Address to connect to; falls back to the host name.
    pub fn hostname(&self) -> &str {
        self.attribute_str(HostKeys::HOSTNAME).unwrap_or(&self.name)
    }

    pub fn remote_user(&self) -> Option<&str> {
        self.attribute_str(HostKeys::REMOTE_USER)
    }

    pub fn port(&self) -> u16 {
        self.attributes
            .get(HostKeys::PORT)
            .and_then(parse_port)
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn identity_file(&self) -> Option<&str> {
        self.attribute_str(HostKeys::IDENTITY_FILE)
    }

    pub fn deploy_path(&self) -> Option<&str> {
        self.attribute_str(HostKeys::DEPLOY_PATH)
    }

    /// `user@hostname`, or just the hostname when no user is set.
    pub fn ssh_target(&self) -> String {
        match self.remote_user() {
            Some(user) => format!("{}@{}", user, self.hostname()),
            None => self.hostname().to_string(),
        }
    }
}

/// Hosts in declaration order, unique by name.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Vec<Host>,
    index: HashMap<String, usize>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, attributes: HostAttributes) -> Result<&Host> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation_invalid_argument(
                "hosts.name",
                "Host name cannot be empty",
                None,
                None,
            ));
        }
        if self.index.contains_key(&name) {
            return Err(Error::host_duplicate(name));
        }
        if let Some(port) = attributes.get(HostKeys::PORT) {
            if parse_port(port).is_none() {
                return Err(Error::config_invalid_value(
                    format!("hosts.{}.port", name),
                    Some(port.to_string()),
                    "Expected a port number between 1 and 65535",
                ));
            }
        }

        let idx = self.hosts.len();
        self.index.insert(name.clone(), idx);
        self.hosts.push(Host::new(name, attributes));
        Ok(&self.hosts[idx])
    }

    pub fn get(&self, name: &str) -> Result<&Host> {
        self.index
            .get(name)
            .map(|&idx| &self.hosts[idx])
            .ok_or_else(|| {
                Error::host_not_found(name, suggest::similar_names(name, self.names()))
            })
    }

    /// All hosts in declaration order. Each call starts a fresh iterator.
    pub fn all(&self) -> impl Iterator<Item = &Host> + '_ {
        self.hosts.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.hosts.iter().map(|h| h.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Select hosts matching any of the glob `patterns`, in declaration order.
    ///
    /// An empty pattern list selects every host. A pattern without glob
    /// characters must name a declared host.
    pub fn select(&self, patterns: &[String]) -> Result<Vec<&Host>> {
        if patterns.is_empty() {
            return Ok(self.all().collect());
        }

        for pattern in patterns {
            if !is_glob(pattern) {
                self.get(pattern)?;
            }
        }

        Ok(self
            .all()
            .filter(|host| {
                patterns
                    .iter()
                    .any(|p| glob_match::glob_match(p, host.name()))
            })
            .collect())
    }
}

fn parse_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    port.filter(|p| *p > 0)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}
