//! Declaration files (`hoist.yml`, `.yaml`, `.json`, `.toml`) and the
//! explicit build step that turns one into registries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{ConfigStore, Scope};
use crate::error::{Error, Result};
use crate::host::{HostAttributes, HostRegistry};
use crate::recipe::{self, DEFAULT_RECOVERY_TASK};
use crate::remote::SshExecutor;
use crate::scheduler::{ExecutionMode, SchedulerConfig};
use crate::secrets::{EnvSecrets, KeyringSecrets, SecretProvider};
use crate::ssh::SshOptions;
use crate::task::{HookKind, Step, Task, TaskGraph};

pub const DEFAULT_FILE_NAMES: &[&str] = &["hoist.yml", "hoist.yaml", "hoist.json", "hoist.toml"];

const DEFAULT_MAX_PARALLEL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Ok(Format::Yaml),
            Some("json") => Ok(Format::Json),
            Some("toml") => Ok(Format::Toml),
            other => Err(Error::config_invalid_file(
                path.display().to_string(),
                format!(
                    "Unsupported extension {:?}; expected .yml, .yaml, .json or .toml",
                    other.unwrap_or("")
                ),
            )),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Declaration {
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
    #[serde(default)]
    pub settings: Settings,
}

/// Host entry. Every key besides `name` and `config` is a host attribute.
#[derive(Debug, Clone, Deserialize)]
pub struct HostSpec {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<StepSpec>>,
    /// Shorthand for a single `run` step.
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Task(String),
    Inline(InlineStep),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InlineStep {
    Run(String),
    Local(String),
    Upload { from: String, to: String },
    Task(String),
}

impl From<StepSpec> for Step {
    fn from(spec: StepSpec) -> Self {
        match spec {
            StepSpec::Task(name) | StepSpec::Inline(InlineStep::Task(name)) => Step::Task(name),
            StepSpec::Inline(InlineStep::Run(command)) => Step::run(command),
            StepSpec::Inline(InlineStep::Local(command)) => Step::local(command),
            StepSpec::Inline(InlineStep::Upload { from, to }) => Step::upload(from, to),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookSpec {
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    pub task: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeChoice {
    #[default]
    Common,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretsChoice {
    #[default]
    Env,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub recovery_task: Option<String>,
    #[serde(default)]
    pub recipe: RecipeChoice,
    #[serde(default)]
    pub secrets: SecretsChoice,
    #[serde(default = "default_multiplex")]
    pub multiplex: bool,
}

fn default_multiplex() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallel: false,
            max_parallel: None,
            recovery_task: None,
            recipe: RecipeChoice::default(),
            secrets: SecretsChoice::default(),
            multiplex: default_multiplex(),
        }
    }
}

impl Settings {
    pub fn mode(&self) -> ExecutionMode {
        if self.parallel {
            ExecutionMode::Parallel {
                max_hosts: self.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL).max(1),
            }
        } else {
            ExecutionMode::Sequential
        }
    }

    pub fn recovery_task(&self) -> String {
        self.recovery_task
            .clone()
            .unwrap_or_else(|| DEFAULT_RECOVERY_TASK.to_string())
    }
}

pub fn parse(content: &str, format: Format, source: &str) -> Result<Declaration> {
    let parsed = match format {
        Format::Yaml => serde_yml::from_str(content).map_err(|e| e.to_string()),
        Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        Format::Toml => toml::from_str(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| Error::config_invalid_file(source, e))
}

pub fn load(path: &Path) -> Result<Declaration> {
    let format = Format::from_path(path)?;
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config_invalid_file(path.display().to_string(), e.to_string())
    })?;
    parse(&content, format, &path.display().to_string())
}

/// First default file name present in `dir`.
pub fn find_default(dir: &Path) -> Result<PathBuf> {
    DEFAULT_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            Error::config_invalid_file(
                dir.join(DEFAULT_FILE_NAMES[0]).display().to_string(),
                "No declaration file found",
            )
            .with_hint("Create hoist.yml or pass --file")
        })
}

/// Registries built from a declaration, ready to schedule.
#[derive(Debug)]
pub struct Deployment {
    pub hosts: HostRegistry,
    pub config: ConfigStore,
    pub tasks: TaskGraph,
    pub settings: Settings,
    /// Directory local paths resolve against.
    pub base_dir: PathBuf,
}

impl Deployment {
    pub fn load(path: &Path) -> Result<Self> {
        let declaration = load(path)?;
        let base_dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::build(declaration, base_dir)
    }

    /// Global config is applied first so it overrides recipe defaults; the
    /// recipe is installed before declared tasks so they can replace or
    /// disable recipe tasks.
    pub fn build(declaration: Declaration, base_dir: PathBuf) -> Result<Self> {
        let Declaration {
            config: globals,
            hosts: host_specs,
            tasks: task_specs,
            hooks,
            settings,
        } = declaration;

        let mut config = ConfigStore::new();
        for (key, value) in globals {
            config.set_global(key, value);
        }

        let mut tasks = TaskGraph::new();
        if settings.recipe == RecipeChoice::Common {
            recipe::install(&mut tasks, &mut config);
        }

        let mut hosts = HostRegistry::new();
        for spec in host_specs {
            let attributes: HostAttributes = spec.attributes.into_iter().collect();
            let host = hosts.declare(spec.name, attributes)?;
            let scope = Scope::Host(host.name().to_string());
            for (key, value) in spec.config {
                config.set(key, value, scope.clone());
            }
        }

        for spec in task_specs {
            apply_task(&mut tasks, spec)?;
        }

        for hook in hooks {
            let (trigger, kind) = match (hook.before, hook.after) {
                (Some(trigger), None) => (trigger, HookKind::Before),
                (None, Some(trigger)) => (trigger, HookKind::After),
                _ => {
                    return Err(Error::validation_invalid_argument(
                        "hooks",
                        format!(
                            "Hook for '{}' must set exactly one of 'before' or 'after'",
                            hook.task
                        ),
                        Some(hook.task),
                        None,
                    ))
                }
            };
            tasks.bind_hook(trigger, kind, hook.task);
        }

        Ok(Self {
            hosts,
            config,
            tasks,
            settings,
            base_dir,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            mode: self.settings.mode(),
            recovery_task: Some(self.settings.recovery_task()),
            local_dir: Some(self.base_dir.clone()),
            ..SchedulerConfig::default()
        }
    }

    pub fn executor(&self) -> SshExecutor {
        SshExecutor::new(SshOptions {
            multiplex: self.settings.multiplex,
            ..SshOptions::default()
        })
    }

    pub fn secrets(&self) -> Box<dyn SecretProvider> {
        match self.settings.secrets {
            SecretsChoice::Env => Box::new(EnvSecrets),
            SecretsChoice::Keyring => Box::new(KeyringSecrets::new()),
        }
    }
}

fn apply_task(tasks: &mut TaskGraph, spec: TaskSpec) -> Result<()> {
    let steps = match (spec.steps, spec.run) {
        (Some(_), Some(_)) => {
            return Err(Error::validation_invalid_argument(
                "tasks",
                format!("Task '{}' sets both 'steps' and 'run'", spec.name),
                Some(spec.name),
                None,
            ))
        }
        (Some(steps), None) => Some(steps.into_iter().map(Step::from).collect::<Vec<_>>()),
        (None, Some(command)) => Some(vec![Step::run(command)]),
        (None, None) => None,
    };

    match steps {
        Some(steps) => {
            let mut task = Task::new(spec.name, steps);
            task.description = spec.description;
            task.enabled = !spec.disabled.unwrap_or(false);
            tasks.define_task(task);
            Ok(())
        }
        None => match spec.disabled {
            Some(true) => tasks.disable(&spec.name),
            Some(false) => tasks.enable(&spec.name),
            None => Err(Error::validation_invalid_argument(
                "tasks",
                format!("Task '{}' has no steps", spec.name),
                Some(spec.name),
                None,
            )
            .with_hint("Add 'steps' or 'run', or set 'disabled' to toggle an existing task")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const YAML: &str = r#"
config:
  application: shop
  repository: git@example.com:shop.git
  shared_dirs: [storage]

hosts:
  - name: web1
    hostname: 10.0.0.1
    remote_user: deploy
    port: 2222
    deploy_path: /var/www/shop
    config:
      branch: stable
  - name: web2
    hostname: 10.0.0.2
    deploy_path: /var/www/shop

tasks:
  - name: deploy:update_code
    disabled: true
  - name: build
    description: Build assets
    steps:
      - local: npm run build
      - upload:
          from: dist/app.js
          to: "{{release_path}}/public/app.js"
      - notify
  - name: notify
    run: curl -s --unix-socket /run/app.sock http://localhost/reload

hooks:
  - after: deploy:update_code
    task: rsync
  - after: deploy:update_code
    task: build

settings:
  parallel: true
  max_parallel: 4
"#;

    fn build(content: &str, format: Format) -> Result<Deployment> {
        let declaration = parse(content, format, "test")?;
        Deployment::build(declaration, PathBuf::from("/srv/app"))
    }

    #[test]
    fn yaml_declaration_builds_registries() {
        let deployment = build(YAML, Format::Yaml).unwrap();

        let web1 = deployment.hosts.get("web1").unwrap();
        assert_eq!(web1.port(), 2222);
        assert_eq!(web1.ssh_target(), "deploy@10.0.0.1");
        assert_eq!(
            deployment.config.get_str("branch", Some(web1)).unwrap(),
            "stable"
        );
        let web2 = deployment.hosts.get("web2").unwrap();
        assert_eq!(deployment.config.get_str("branch", Some(web2)).unwrap(), "main");

        assert!(!deployment.tasks.task("deploy:update_code").unwrap().enabled);
        assert_eq!(
            deployment.settings.mode(),
            ExecutionMode::Parallel { max_hosts: 4 }
        );

        let plan = deployment.tasks.resolve("deploy").unwrap();
        let tasks: Vec<&str> = plan.iter().map(|s| s.task.as_str()).collect();
        let rsync = tasks.iter().position(|t| *t == "rsync").unwrap();
        assert_eq!(&tasks[rsync + 1..rsync + 4], &["build", "build", "notify"]);
        assert!(!tasks.contains(&"deploy:update_code"));
    }

    #[test]
    fn json_declaration_matches_yaml_shape() {
        let json = r#"{
            "hosts": [{"name": "api", "hostname": "localhost", "deploy_path": "/tmp/api"}],
            "tasks": [{"name": "hello", "steps": ["ping", {"run": "echo hi"}]},
                      {"name": "ping", "run": "true"}],
            "settings": {"recipe": "none"}
        }"#;
        let deployment = build(json, Format::Json).unwrap();

        assert!(!deployment.tasks.contains("deploy"));
        assert_eq!(deployment.tasks.resolve("hello").unwrap().len(), 2);
        assert_eq!(deployment.settings.mode(), ExecutionMode::Sequential);
    }

    #[test]
    fn toml_declaration_is_accepted() {
        let toml = r#"
[config]
keep_releases = 3

[[hosts]]
name = "db"
deploy_path = "/srv/db"

[[tasks]]
name = "migrate"
steps = [{ run = "php artisan migrate --force" }]

[[hooks]]
before = "deploy:symlink"
task = "migrate"

[settings]
secrets = "keyring"
"#;
        let deployment = build(toml, Format::Toml).unwrap();

        assert_eq!(deployment.config.get_u64("keep_releases", None).unwrap(), 3);
        assert_eq!(deployment.settings.secrets, SecretsChoice::Keyring);
        let plan = deployment.tasks.resolve("deploy:publish").unwrap();
        assert_eq!(plan[0].task, "migrate");
    }

    #[test]
    fn duplicate_host_is_rejected() {
        let yaml = "hosts:\n  - name: web\n  - name: web\n";
        assert_eq!(
            build(yaml, Format::Yaml).unwrap_err().code,
            ErrorCode::HostDuplicate
        );
    }

    #[test]
    fn toggling_unknown_task_is_rejected() {
        let yaml = "tasks:\n  - name: deploy:nothing\n    disabled: true\n";
        assert_eq!(
            build(yaml, Format::Yaml).unwrap_err().code,
            ErrorCode::TaskNotFound
        );
    }

    #[test]
    fn hook_needs_exactly_one_trigger() {
        let yaml = "hooks:\n  - before: a\n    after: b\n    task: c\n";
        assert_eq!(
            build(yaml, Format::Yaml).unwrap_err().code,
            ErrorCode::ValidationInvalidArgument
        );
    }

    #[test]
    fn malformed_file_reports_source() {
        let err = parse("hosts: [", Format::Yaml, "hoist.yml").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidFile);
        assert_eq!(err.details["path"], "hoist.yml");
    }

    #[test]
    fn load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hoist.json");
        std::fs::write(&path, r#"{"hosts": [{"name": "a"}]}"#).unwrap();

        assert_eq!(find_default(dir.path()).unwrap(), path);
        let deployment = Deployment::load(&path).unwrap();
        assert_eq!(deployment.hosts.len(), 1);
        assert_eq!(deployment.base_dir, dir.path());

        let bad = dir.path().join("hoist.ini");
        std::fs::write(&bad, "").unwrap();
        assert_eq!(
            Deployment::load(&bad).unwrap_err().code,
            ErrorCode::ConfigInvalidFile
        );
    }
}
