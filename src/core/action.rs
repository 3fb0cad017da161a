//! Leaf actions and the per-host context they run in.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{value_to_string, ConfigStore};
use crate::error::{Error, RemoteCommandFailedDetails, Result};
use crate::host::Host;
use crate::remote::Connection;
use crate::secrets::SecretProvider;
use crate::ssh::execute_local_command_in_dir;
use crate::utils::template;

/// A single unit of work in a plan.
pub trait TaskAction: Send + Sync {
    /// Short human-readable form, e.g. the command line.
    fn describe(&self) -> String;

    /// Run against the context's host; returns captured output.
    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<String>;
}

pub type ActionFn = dyn Fn(&mut TaskContext<'_>) -> Result<String> + Send + Sync;

/// Everything an action may touch while running on one host.
///
/// `vars` is the per-run overlay owned by this host's thread; lookups check
/// it before the [`ConfigStore`].
pub struct TaskContext<'a> {
    host: &'a Host,
    config: &'a ConfigStore,
    connection: &'a mut Connection,
    secrets: &'a dyn SecretProvider,
    vars: &'a mut HashMap<String, Value>,
    local_dir: Option<&'a Path>,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        host: &'a Host,
        config: &'a ConfigStore,
        connection: &'a mut Connection,
        secrets: &'a dyn SecretProvider,
        vars: &'a mut HashMap<String, Value>,
        local_dir: Option<&'a Path>,
    ) -> Self {
        Self {
            host,
            config,
            connection,
            secrets,
            vars,
            local_dir,
        }
    }

    pub fn host(&self) -> &Host {
        self.host
    }

    pub fn secrets(&self) -> &dyn SecretProvider {
        self.secrets
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        if let Some(value) = self.vars.get(key) {
            return Ok(value.clone());
        }
        self.config.get(key, Some(self.host)).cloned()
    }

    pub fn get_str(&self, key: &str) -> Result<String> {
        self.get(key).map(|v| value_to_string(&v))
    }

    pub fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or_else(|_| default.to_string())
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.vars.get(key) {
            Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
            Some(other) => value_to_string(other)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            None => self.config.get_list(key, Some(self.host)),
        }
    }

    /// Set a per-run variable for the rest of this host's plan.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn render(&self, template: &str) -> Result<String> {
        let host_name = self.host.name().to_string();
        template::render(template, |key| {
            if let Some(value) = self.vars.get(key) {
                return Ok(Some(value_to_string(value)));
            }
            match self.config.get(key, Some(self.host)) {
                Ok(value) => Ok(Some(value_to_string(value))),
                Err(_) => Err(Error::config_missing_key(key, Some(host_name.clone()))),
            }
        })
    }

    /// Render and run a command on the host.
    pub fn run(&mut self, command: &str) -> Result<String> {
        let rendered = self.render(command)?;
        self.exec(&rendered)
    }

    /// Run a command on the host as-is.
    pub fn exec(&mut self, command: &str) -> Result<String> {
        self.connection.run_command(command)
    }

    /// Render and run a command on the machine running hoist.
    pub fn run_local(&mut self, command: &str) -> Result<String> {
        let rendered = self.render(command)?;
        self.exec_local(&rendered)
    }

    pub fn exec_local(&mut self, command: &str) -> Result<String> {
        let output = execute_local_command_in_dir(command, self.local_dir);
        if output.success {
            return Ok(output.stdout);
        }

        Err(Error::remote_command_failed(RemoteCommandFailedDetails {
            command: command.to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            host: "localhost".to_string(),
        }))
    }

    /// Upload a local file; `remote_path` is rendered, `local_path` is
    /// resolved against the declaration directory when relative.
    pub fn upload(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        let remote = self.render(remote_path)?;
        let local = self.local_path(local_path);
        self.connection.upload_file(&local, &remote)
    }

    pub fn local_path(&self, path: &Path) -> PathBuf {
        match self.local_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Run a templated command on the host.
pub struct Command {
    pub command: String,
}

impl TaskAction for Command {
    fn describe(&self) -> String {
        format!("run: {}", self.command.trim())
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<String> {
        ctx.run(&self.command)
    }
}

/// Run a templated command locally.
pub struct LocalCommand {
    pub command: String,
}

impl TaskAction for LocalCommand {
    fn describe(&self) -> String {
        format!("local: {}", self.command.trim())
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<String> {
        ctx.run_local(&self.command)
    }
}

/// Upload a file; both paths are templates.
pub struct Upload {
    pub from: String,
    pub to: String,
}

impl TaskAction for Upload {
    fn describe(&self) -> String {
        format!("upload: {} -> {}", self.from, self.to)
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<String> {
        let from = ctx.render(&self.from)?;
        ctx.upload(Path::new(&from), &self.to)?;
        Ok(String::new())
    }
}

/// Inline closure action.
pub struct Callback {
    pub label: String,
    pub f: Arc<ActionFn>,
}

impl TaskAction for Callback {
    fn describe(&self) -> String {
        format!("call: {}", self.label)
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<String> {
        (self.f)(ctx)
    }
}

pub fn command(command: impl Into<String>) -> Arc<dyn TaskAction> {
    Arc::new(Command {
        command: command.into(),
    })
}

pub fn local(command: impl Into<String>) -> Arc<dyn TaskAction> {
    Arc::new(LocalCommand {
        command: command.into(),
    })
}

pub fn upload(from: impl Into<String>, to: impl Into<String>) -> Arc<dyn TaskAction> {
    Arc::new(Upload {
        from: from.into(),
        to: to.into(),
    })
}

pub fn callback<F>(label: impl Into<String>, f: F) -> Arc<dyn TaskAction>
where
    F: Fn(&mut TaskContext<'_>) -> Result<String> + Send + Sync + 'static,
{
    Arc::new(Callback {
        label: label.into(),
        f: Arc::new(f),
    })
}
