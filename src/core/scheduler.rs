//! Runs a resolved plan across hosts and drives per-host recovery.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::thread;

use crate::action::TaskContext;
use crate::cancel::CancelToken;
use crate::config::ConfigStore;
use crate::error::{Error, ErrorCode, Hint, Result};
use crate::host::Host;
use crate::recipe::DEFAULT_RECOVERY_TASK;
use crate::remote::{Connection, RemoteExecutor};
use crate::secrets::SecretProvider;
use crate::task::{PlannedStep, TaskGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ExecutionMode {
    Sequential,
    /// Hosts run concurrently in batches of at most `max_hosts`.
    Parallel { max_hosts: usize },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub mode: ExecutionMode,
    /// Task run on a host after its plan fails. `None` disables recovery.
    pub recovery_task: Option<String>,
    pub dry_run: bool,
    /// Base directory for local paths (the declaration file's directory).
    pub local_dir: Option<PathBuf>,
    pub cancel: CancelToken,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            recovery_task: Some(DEFAULT_RECOVERY_TASK.to_string()),
            dry_run: false,
            local_dir: None,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Recovering,
    Recovered,
    RecoveryFailed,
}

impl HostState {
    pub fn is_success(&self) -> bool {
        matches!(self, HostState::Succeeded | HostState::Recovered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Pending => "pending",
            HostState::Running => "running",
            HostState::Succeeded => "succeeded",
            HostState::Failed => "failed",
            HostState::Recovering => "recovering",
            HostState::Recovered => "recovered",
            HostState::RecoveryFailed => "recovery_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Serializable snapshot of an [`Error`].
#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Hint>,
}

impl From<&Error> for StepError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            details: err.details.clone(),
            hints: err.hints.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub task: String,
    pub action: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// The step that stopped a host. `task` is `None` when the host was never
/// reached.
#[derive(Debug, Clone, Serialize)]
pub struct HostFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub error: StepError,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    pub state: HostState,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<HostFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovery_steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovery_errors: Vec<StepError>,
}

impl HostReport {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: HostState::Pending,
            steps: Vec::new(),
            failure: None,
            recovery_steps: Vec::new(),
            recovery_errors: Vec::new(),
        }
    }

    pub fn failure_code(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.error.code.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_hosts: usize,
    pub succeeded: usize,
    pub recovered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub root: String,
    pub dry_run: bool,
    pub success: bool,
    pub hosts: Vec<HostReport>,
    pub summary: RunSummary,
}

impl RunReport {
    fn new(root: &str, dry_run: bool, hosts: Vec<HostReport>) -> Self {
        let count = |state: HostState| hosts.iter().filter(|h| h.state == state).count();
        let succeeded = count(HostState::Succeeded);
        let recovered = count(HostState::Recovered);
        let success = hosts
            .iter()
            .all(|h| h.state.is_success() || (dry_run && h.state == HostState::Pending));

        Self {
            root: root.to_string(),
            dry_run,
            success,
            summary: RunSummary {
                total_hosts: hosts.len(),
                succeeded,
                recovered,
                failed: hosts.len() - succeeded - recovered,
            },
            hosts,
        }
    }

    pub fn failed_hosts(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts.iter().filter(|h| !h.state.is_success())
    }
}

pub struct Scheduler<'a> {
    graph: &'a TaskGraph,
    config: &'a ConfigStore,
    executor: &'a dyn RemoteExecutor,
    secrets: &'a dyn SecretProvider,
    settings: SchedulerConfig,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a TaskGraph,
        config: &'a ConfigStore,
        executor: &'a dyn RemoteExecutor,
        secrets: &'a dyn SecretProvider,
        settings: SchedulerConfig,
    ) -> Self {
        Self {
            graph,
            config,
            executor,
            secrets,
            settings,
        }
    }

    /// Run `root` on every host in `hosts`.
    ///
    /// Plan resolution errors are returned before any host is contacted.
    /// Per-host failures are recorded in the report, never returned.
    pub fn run(&self, root: &str, hosts: &[&Host]) -> Result<RunReport> {
        let plan = self.graph.resolve(root)?;
        let recovery = match &self.settings.recovery_task {
            Some(name) if self.graph.contains(name) => Some(self.graph.resolve(name)?),
            _ => None,
        };

        log_status!(
            "plan",
            "{}: {} step(s) on {} host(s)",
            root,
            plan.len(),
            hosts.len()
        );

        let reports: Vec<HostReport> = if self.settings.dry_run {
            hosts.iter().map(|host| dry_run_host(host, &plan)).collect()
        } else {
            match self.settings.mode {
                ExecutionMode::Sequential => hosts
                    .iter()
                    .map(|host| self.run_host(host, &plan, recovery.as_deref()))
                    .collect(),
                ExecutionMode::Parallel { max_hosts } => {
                    self.run_parallel(hosts, &plan, recovery.as_deref(), max_hosts)?
                }
            }
        };

        Ok(RunReport::new(root, self.settings.dry_run, reports))
    }

    fn run_parallel(
        &self,
        hosts: &[&Host],
        plan: &[PlannedStep],
        recovery: Option<&[PlannedStep]>,
        max_hosts: usize,
    ) -> Result<Vec<HostReport>> {
        let mut reports = Vec::with_capacity(hosts.len());

        for batch in hosts.chunks(max_hosts.max(1)) {
            let batch_reports = thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|host| scope.spawn(move || self.run_host(host, plan, recovery)))
                    .collect();

                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .map_err(|_| Error::internal_unexpected("Host worker thread panicked"))
                    })
                    .collect::<Result<Vec<_>>>()
            })?;
            reports.extend(batch_reports);
        }

        Ok(reports)
    }

    fn run_host(
        &self,
        host: &Host,
        plan: &[PlannedStep],
        recovery: Option<&[PlannedStep]>,
    ) -> HostReport {
        let mut report = HostReport::new(host.name());

        // Hosts not yet started when the run is cancelled are never contacted.
        if self.settings.cancel.is_cancelled() {
            let err = Error::deploy_aborted(host.name());
            log_status!("deploy", "{}: aborted before start", host.name());
            report.state = HostState::Failed;
            report.failure = Some(HostFailure {
                task: None,
                action: None,
                error: StepError::from(&err),
            });
            return report;
        }

        report.state = HostState::Running;

        let mut connection = match self.executor.connect(host) {
            Ok(connection) => connection,
            Err(err) => {
                log_status!("ssh", "{}: {}", host.name(), err.message);
                report.state = HostState::Failed;
                report.failure = Some(HostFailure {
                    task: None,
                    action: None,
                    error: StepError::from(&err),
                });
                return report;
            }
        };

        let mut vars = HashMap::new();
        let failure = self.run_plan(host, &mut connection, &mut vars, plan, &mut report.steps);

        let Some((failure, code)) = failure else {
            report.state = HostState::Succeeded;
            log_status!("deploy", "{}: succeeded", host.name());
            return report;
        };

        report.state = HostState::Failed;
        report.failure = Some(failure);

        // Recovery is for hosts that were mid-run; a host stopped before its
        // first step or by another run's lock has nothing to undo.
        let started = !report.steps.is_empty();
        let recovery = match recovery {
            Some(steps) if started && code != ErrorCode::RemoteHostLocked => steps,
            _ => return report,
        };

        report.state = HostState::Recovering;
        log_status!("recovery", "{}: running recovery", host.name());
        self.run_recovery(
            host,
            &mut connection,
            &mut vars,
            recovery,
            &mut report.recovery_steps,
            &mut report.recovery_errors,
        );

        report.state = if report.recovery_errors.is_empty() {
            HostState::Recovered
        } else {
            HostState::RecoveryFailed
        };
        report
    }

    /// Run steps in order, stopping at the first failure or cancellation.
    fn run_plan(
        &self,
        host: &Host,
        connection: &mut Connection,
        vars: &mut HashMap<String, Value>,
        plan: &[PlannedStep],
        results: &mut Vec<StepResult>,
    ) -> Option<(HostFailure, ErrorCode)> {
        let mut ctx = TaskContext::new(
            host,
            self.config,
            connection,
            self.secrets,
            vars,
            self.settings.local_dir.as_deref(),
        );

        for (index, step) in plan.iter().enumerate() {
            let action = step.describe();

            if self.settings.cancel.is_cancelled() {
                let err = Error::deploy_aborted(host.name());
                log_status!("deploy", "{}: aborted before {}", host.name(), step.task);
                return Some((
                    HostFailure {
                        task: Some(step.task.clone()),
                        action: Some(action),
                        error: StepError::from(&err),
                    },
                    err.code,
                ));
            }

            log_status!(
                "deploy",
                "{} [{}/{}] {}: {}",
                host.name(),
                index + 1,
                plan.len(),
                step.task,
                action
            );

            match step.action.execute(&mut ctx) {
                Ok(output) => results.push(succeeded(step, action, output)),
                Err(err) => {
                    log_status!("deploy", "{}: {} failed: {}", host.name(), step.task, err.message);
                    results.push(failed(step, action.clone(), &err));
                    return Some((
                        HostFailure {
                            task: Some(step.task.clone()),
                            action: Some(action),
                            error: StepError::from(&err),
                        },
                        err.code,
                    ));
                }
            }
        }

        None
    }

    /// Run every recovery step regardless of earlier recovery errors or
    /// cancellation.
    fn run_recovery(
        &self,
        host: &Host,
        connection: &mut Connection,
        vars: &mut HashMap<String, Value>,
        steps: &[PlannedStep],
        results: &mut Vec<StepResult>,
        errors: &mut Vec<StepError>,
    ) {
        let mut ctx = TaskContext::new(
            host,
            self.config,
            connection,
            self.secrets,
            vars,
            self.settings.local_dir.as_deref(),
        );

        for step in steps {
            let action = step.describe();
            log_status!("recovery", "{} {}: {}", host.name(), step.task, action);

            match step.action.execute(&mut ctx) {
                Ok(output) => results.push(succeeded(step, action, output)),
                Err(err) => {
                    log_status!("recovery", "{}: {} failed: {}", host.name(), step.task, err.message);
                    errors.push(StepError::from(&err));
                    results.push(failed(step, action, &err));
                }
            }
        }
    }
}

fn dry_run_host(host: &Host, plan: &[PlannedStep]) -> HostReport {
    let mut report = HostReport::new(host.name());
    report.steps = plan
        .iter()
        .map(|step| StepResult {
            task: step.task.clone(),
            action: step.describe(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
        })
        .collect();
    report
}

fn succeeded(step: &PlannedStep, action: String, output: String) -> StepResult {
    let output = output.trim();
    StepResult {
        task: step.task.clone(),
        action,
        status: StepStatus::Success,
        output: if output.is_empty() {
            None
        } else {
            Some(output.to_string())
        },
        error: None,
    }
}

fn failed(step: &PlannedStep, action: String, err: &Error) -> StepResult {
    StepResult {
        task: step.task.clone(),
        action,
        status: StepStatus::Failed,
        output: None,
        error: Some(StepError::from(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scope;
    use crate::error::TransferFailedDetails;
    use crate::host::{HostAttributes, HostRegistry};
    use crate::recipe;
    use crate::remote::{Session, SshExecutor};
    use crate::secrets::StaticSecrets;
    use crate::task::Step;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    /// Runs everything locally through [`SshExecutor`] and records traffic.
    #[derive(Default)]
    struct RecordingExecutor {
        inner: SshExecutor,
        opens: Arc<Mutex<usize>>,
        commands: Arc<Mutex<Vec<(String, String)>>>,
        uploads: Arc<Mutex<Vec<PathBuf>>>,
        fail_uploads: bool,
        fail_connect: bool,
    }

    impl RecordingExecutor {
        fn commands_for(&self, host: &str) -> Vec<String> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, c)| c.clone())
                .collect()
        }
    }

    struct RecordingSession {
        host: String,
        inner: Box<dyn Session>,
        commands: Arc<Mutex<Vec<(String, String)>>>,
        uploads: Arc<Mutex<Vec<PathBuf>>>,
        fail_uploads: bool,
    }

    impl RemoteExecutor for RecordingExecutor {
        fn open(&self, host: &Host) -> Result<Box<dyn Session>> {
            *self.opens.lock().unwrap() += 1;
            if self.fail_connect {
                return Err(Error::ssh_connect_failed(host.name(), 255, "Connection refused"));
            }
            Ok(Box::new(RecordingSession {
                host: host.name().to_string(),
                inner: self.inner.open(host)?,
                commands: Arc::clone(&self.commands),
                uploads: Arc::clone(&self.uploads),
                fail_uploads: self.fail_uploads,
            }))
        }
    }

    impl Session for RecordingSession {
        fn run_command(&mut self, command: &str) -> Result<String> {
            self.commands
                .lock()
                .unwrap()
                .push((self.host.clone(), command.to_string()));
            self.inner.run_command(command)
        }

        fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
            self.uploads.lock().unwrap().push(local_path.to_path_buf());
            if self.fail_uploads {
                return Err(Error::remote_transfer_failed(TransferFailedDetails {
                    local_path: local_path.display().to_string(),
                    remote_path: remote_path.to_string(),
                    host: self.host.clone(),
                    error: "disk full".to_string(),
                }));
            }
            self.inner.upload_file(local_path, remote_path)
        }

        fn close(&mut self) {
            self.inner.close();
        }
    }

    fn declare_local(registry: &mut HostRegistry, name: &str, deploy_path: &Path) {
        let mut attrs = HostAttributes::new();
        attrs.insert("hostname".to_string(), json!("localhost"));
        attrs.insert("deploy_path".to_string(), json!(deploy_path.display().to_string()));
        registry.declare(name, attrs).unwrap();
    }

    /// Five steps; the third exits with the host's `fail_code`.
    fn five_step_graph(recovery: &str) -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph.define(
            "work",
            vec![
                Step::run("echo one"),
                Step::run("echo two"),
                Step::run("exit {{fail_code}}"),
                Step::run("echo four"),
                Step::run("echo five"),
            ],
        );
        graph.define("deploy:failed", vec![Step::run(recovery)]);
        graph
    }

    fn two_hosts(a: &Path, b: &Path) -> (HostRegistry, ConfigStore) {
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "a", a);
        declare_local(&mut registry, "b", b);
        let mut config = ConfigStore::new();
        config.set_global("fail_code", 0);
        config.set("fail_code", 3, Scope::Host("a".to_string()));
        (registry, config)
    }

    fn assert_a_recovered_b_succeeded(report: &RunReport, a: &Path, b: &Path) {
        let host_a = &report.hosts[0];
        let host_b = &report.hosts[1];

        assert_eq!(host_a.state, HostState::Recovered);
        assert_eq!(host_a.steps.len(), 3);
        assert_eq!(host_a.steps[2].status, StepStatus::Failed);
        assert_eq!(host_a.failure_code(), Some("remote.command_failed"));
        assert!(a.join("recovered").exists());

        assert_eq!(host_b.state, HostState::Succeeded);
        assert_eq!(host_b.steps.len(), 5);
        assert!(host_b.steps.iter().all(|s| s.status == StepStatus::Success));
        assert!(!b.join("recovered").exists());

        assert!(report.success);
        assert_eq!(report.summary.recovered, 1);
        assert_eq!(report.summary.succeeded, 1);
    }

    #[test]
    fn failing_host_recovers_while_other_host_completes() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (registry, config) = two_hosts(a.path(), b.path());
        let graph = five_step_graph("touch {{deploy_path}}/recovered");
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let scheduler =
            Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default());
        let report = scheduler.run("work", &hosts).unwrap();

        assert_a_recovered_b_succeeded(&report, a.path(), b.path());
    }

    #[test]
    fn parallel_mode_isolates_host_failures() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (registry, config) = two_hosts(a.path(), b.path());
        let graph = five_step_graph("touch {{deploy_path}}/recovered");
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let settings = SchedulerConfig {
            mode: ExecutionMode::Parallel { max_hosts: 2 },
            ..SchedulerConfig::default()
        };
        let report = Scheduler::new(&graph, &config, &executor, &secrets, settings)
            .run("work", &hosts)
            .unwrap();

        assert_a_recovered_b_succeeded(&report, a.path(), b.path());
        assert_eq!(*executor.opens.lock().unwrap(), 2);
    }

    #[test]
    fn failing_recovery_marks_host_recovery_failed() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (registry, config) = two_hosts(a.path(), b.path());
        let mut graph = five_step_graph("exit 9");
        graph.define("notify", vec![Step::run("touch {{deploy_path}}/notified")]);
        graph.after("deploy:failed", "notify");
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let report = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("work", &hosts)
            .unwrap();

        let host_a = &report.hosts[0];
        assert_eq!(host_a.state, HostState::RecoveryFailed);
        assert_eq!(host_a.recovery_errors.len(), 1);
        assert_eq!(host_a.recovery_steps.len(), 2);
        assert!(a.path().join("notified").exists());
        assert!(!report.success);
        assert_eq!(report.failed_hosts().count(), 1);
    }

    #[test]
    fn without_recovery_task_failed_is_terminal() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (registry, config) = two_hosts(a.path(), b.path());
        let graph = five_step_graph("touch {{deploy_path}}/recovered");
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let settings = SchedulerConfig {
            recovery_task: None,
            ..SchedulerConfig::default()
        };
        let report = Scheduler::new(&graph, &config, &executor, &secrets, settings)
            .run("work", &hosts)
            .unwrap();

        assert_eq!(report.hosts[0].state, HostState::Failed);
        assert!(!a.path().join("recovered").exists());
        assert!(!report.success);
    }

    #[test]
    fn locked_host_fails_after_one_command_without_recovery() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".dep")).unwrap();
        std::fs::write(dir.path().join(recipe::LOCK_FILE), "bob 2026-10-01\n").unwrap();

        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let mut graph = TaskGraph::new();
        let mut config = ConfigStore::new();
        recipe::install(&mut graph, &mut config);
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let report = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("deploy", &hosts)
            .unwrap();

        let host = &report.hosts[0];
        assert_eq!(host.state, HostState::Failed);
        assert_eq!(host.failure_code(), Some("remote.host_locked"));
        assert!(host.recovery_steps.is_empty());
        assert_eq!(executor.commands_for("web").len(), 1);
        assert!(dir.path().join(recipe::LOCK_FILE).exists());
    }

    #[test]
    fn failed_deploy_releases_lock_through_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let mut graph = TaskGraph::new();
        let mut config = ConfigStore::new();
        recipe::install(&mut graph, &mut config);
        graph.disable("deploy:update_code").unwrap();
        graph.define("build", vec![Step::run("exit 1")]);
        graph.after("deploy:update_code", "build");
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let report = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("deploy", &hosts)
            .unwrap();

        assert_eq!(report.hosts[0].state, HostState::Recovered);
        assert_eq!(report.hosts[0].failure.as_ref().unwrap().task.as_deref(), Some("build"));
        assert!(!dir.path().join(recipe::LOCK_FILE).exists());
        assert!(!dir.path().join("current").exists());
    }

    #[test]
    fn secrets_temp_file_is_removed_when_upload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let mut graph = TaskGraph::new();
        let mut config = ConfigStore::new();
        recipe::install(&mut graph, &mut config);
        let executor = RecordingExecutor {
            fail_uploads: true,
            ..RecordingExecutor::default()
        };
        let secrets = StaticSecrets::new().with("DOTENV", "APP_KEY=secret\n");
        let hosts: Vec<&Host> = registry.all().collect();

        let report = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("deploy:secrets", &hosts)
            .unwrap();

        assert_eq!(report.hosts[0].failure_code(), Some("remote.transfer_failed"));
        let uploads = executor.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert!(!uploads[0].exists());
    }

    #[test]
    fn secrets_are_uploaded_to_shared() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let mut graph = TaskGraph::new();
        let mut config = ConfigStore::new();
        recipe::install(&mut graph, &mut config);
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new().with("DOTENV", "APP_KEY=secret\n");
        let hosts: Vec<&Host> = registry.all().collect();

        let report = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("deploy:secrets", &hosts)
            .unwrap();

        assert!(report.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("shared/.env")).unwrap(),
            "APP_KEY=secret\n"
        );
        assert!(!executor.uploads.lock().unwrap()[0].exists());
    }

    #[test]
    fn dry_run_contacts_no_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let mut graph = TaskGraph::new();
        let mut config = ConfigStore::new();
        recipe::install(&mut graph, &mut config);
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let settings = SchedulerConfig {
            dry_run: true,
            ..SchedulerConfig::default()
        };
        let report = Scheduler::new(&graph, &config, &executor, &secrets, settings)
            .run("deploy", &hosts)
            .unwrap();

        assert!(report.success);
        assert_eq!(*executor.opens.lock().unwrap(), 0);
        assert_eq!(
            report.hosts[0].steps.len(),
            graph.resolve("deploy").unwrap().len()
        );
        assert!(report.hosts[0]
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Skipped));
    }

    #[test]
    fn resolution_errors_precede_any_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let mut graph = TaskGraph::new();
        graph.define("a", vec!["b".into()]);
        graph.define("b", vec!["a".into()]);
        let config = ConfigStore::new();
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let err = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("a", &hosts)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskCyclic);
        assert_eq!(*executor.opens.lock().unwrap(), 0);
    }

    #[test]
    fn unreachable_host_fails_without_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let graph = five_step_graph("true");
        let mut config = ConfigStore::new();
        config.set_global("fail_code", 0);
        let executor = RecordingExecutor {
            fail_connect: true,
            ..RecordingExecutor::default()
        };
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let report = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("work", &hosts)
            .unwrap();

        let host = &report.hosts[0];
        assert_eq!(host.state, HostState::Failed);
        assert_eq!(host.failure_code(), Some("ssh.connect_failed"));
        assert!(host.failure.as_ref().unwrap().task.is_none());
        assert!(host.recovery_steps.is_empty());
    }

    fn foreign_lock(dir: &Path) -> std::path::PathBuf {
        std::fs::create_dir_all(dir.join(".dep")).unwrap();
        let lock = dir.join(recipe::LOCK_FILE);
        std::fs::write(&lock, "carol 2026-10-01\n").unwrap();
        lock
    }

    #[test]
    fn cancelled_before_start_contacts_no_host() {
        let dir = tempfile::tempdir().unwrap();
        let lock = foreign_lock(dir.path());
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let mut graph = TaskGraph::new();
        let mut config = ConfigStore::new();
        recipe::install(&mut graph, &mut config);
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let cancel = CancelToken::new();
        cancel.cancel();
        let settings = SchedulerConfig {
            cancel,
            ..SchedulerConfig::default()
        };
        let report = Scheduler::new(&graph, &config, &executor, &secrets, settings)
            .run("deploy", &hosts)
            .unwrap();

        let host = &report.hosts[0];
        assert_eq!(host.state, HostState::Failed);
        assert_eq!(host.failure_code(), Some("deploy.aborted"));
        assert!(host.steps.is_empty());
        assert!(host.recovery_steps.is_empty());
        assert_eq!(*executor.opens.lock().unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "carol 2026-10-01\n");
    }

    #[test]
    fn cancel_mid_run_recovers_started_host_only() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (registry, config) = two_hosts(a.path(), b.path());
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut graph = TaskGraph::new();
        graph.define(
            "work",
            vec![
                Step::run("echo one"),
                Step::call("stop", move |_| {
                    trigger.cancel();
                    Ok(String::new())
                }),
                Step::run("touch {{deploy_path}}/after-cancel"),
            ],
        );
        graph.define("deploy:failed", vec![Step::run("touch {{deploy_path}}/recovered")]);
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let settings = SchedulerConfig {
            cancel,
            ..SchedulerConfig::default()
        };
        let report = Scheduler::new(&graph, &config, &executor, &secrets, settings)
            .run("work", &hosts)
            .unwrap();

        let host_a = &report.hosts[0];
        assert_eq!(host_a.failure_code(), Some("deploy.aborted"));
        assert_eq!(host_a.steps.len(), 2);
        assert_eq!(host_a.state, HostState::Recovered);
        assert!(a.path().join("recovered").exists());
        assert!(!a.path().join("after-cancel").exists());

        let host_b = &report.hosts[1];
        assert_eq!(host_b.state, HostState::Failed);
        assert!(host_b.recovery_steps.is_empty());
        assert!(!b.path().join("recovered").exists());
        assert_eq!(*executor.opens.lock().unwrap(), 1);
        assert!(!report.success);
    }

    #[test]
    fn failure_before_lock_keeps_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = foreign_lock(dir.path());
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", dir.path());
        let mut graph = TaskGraph::new();
        let mut config = ConfigStore::new();
        recipe::install(&mut graph, &mut config);
        graph.define("preflight", vec![Step::run("exit 1")]);
        graph.before("deploy:lock", "preflight");
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let report = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("deploy", &hosts)
            .unwrap();

        let host = &report.hosts[0];
        assert_eq!(host.failure.as_ref().unwrap().task.as_deref(), Some("preflight"));
        assert_eq!(host.state, HostState::Recovered);
        assert_eq!(host.recovery_steps[0].task, "deploy:unlock");
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "carol 2026-10-01\n");
    }

    #[test]
    fn spaced_deploy_path_is_unlocked_after_deploy() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("my app");
        let mut registry = HostRegistry::new();
        declare_local(&mut registry, "web", &dir);
        let mut graph = TaskGraph::new();
        let mut config = ConfigStore::new();
        recipe::install(&mut graph, &mut config);
        graph.disable("deploy:update_code").unwrap();
        let executor = RecordingExecutor::default();
        let secrets = StaticSecrets::new();
        let hosts: Vec<&Host> = registry.all().collect();

        let report = Scheduler::new(&graph, &config, &executor, &secrets, SchedulerConfig::default())
            .run("deploy", &hosts)
            .unwrap();

        assert!(report.success, "{:?}", report.hosts[0].failure);
        assert!(!dir.join(recipe::LOCK_FILE).exists());
        assert_eq!(
            std::fs::read_link(dir.join("current")).unwrap(),
            dir.join("releases/1")
        );
        assert!(!root.path().join("my").exists());
    }
}
