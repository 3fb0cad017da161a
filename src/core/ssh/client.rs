use crate::error::{Error, Result};
use crate::host::Host;
use crate::utils::shell;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Connection options shared by every host in a run.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Reuse one OpenSSH control master per session.
    pub multiplex: bool,
    pub connect_timeout_secs: u32,
    /// Attempts for transient connection failures (minimum 1).
    pub max_attempts: u32,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            multiplex: true,
            connect_timeout_secs: 10,
            max_attempts: 3,
        }
    }
}

pub struct SshClient {
    pub host_name: String,
    pub target: String,
    pub port: u16,
    pub identity_file: Option<String>,
    /// When true, all commands run locally instead of over SSH.
    /// Set automatically when the hostname is localhost/127.0.0.1/::1.
    pub is_local: bool,
    control_path: Option<PathBuf>,
    options: SshOptions,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    fn failure(stderr: String) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            success: false,
            exit_code: -1,
        }
    }
}

impl SshClient {
    pub fn from_host(host: &Host, options: &SshOptions) -> Result<Self> {
        let identity_file = match host.identity_file() {
            Some(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    return Err(Error::ssh_identity_file_not_found(host.name(), expanded));
                }
                Some(expanded)
            }
            None => None,
        };

        let is_local = is_local_host(host.hostname());
        if is_local {
            log_status!("ssh", "Host '{}' is localhost, using local execution", host.name());
        }

        Ok(Self {
            host_name: host.name().to_string(),
            target: host.ssh_target(),
            port: host.port(),
            identity_file,
            is_local,
            control_path: None,
            options: options.clone(),
        })
    }

    /// Start a control master so later commands reuse one authenticated
    /// connection. No-op for local hosts or when multiplexing is off.
    pub fn open(&mut self) -> Result<()> {
        if self.is_local || !self.options.multiplex || self.control_path.is_some() {
            return Ok(());
        }

        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let socket = std::env::temp_dir().join(format!("hoist-{}.sock", &short_id[..12]));
        let log_file = socket.with_extension("log");

        let mut args = self.base_args(false);
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", socket.display()),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-E".to_string(),
            log_file.display().to_string(),
            "-f".to_string(),
            "-N".to_string(),
            self.target.clone(),
        ]);

        // The backgrounded master keeps inherited pipes open, so its
        // diagnostics go to a log file instead of a captured stderr.
        let status = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let log = std::fs::read_to_string(&log_file).unwrap_or_default();
        let _ = std::fs::remove_file(&log_file);

        match status {
            Ok(s) if s.success() => {
                self.control_path = Some(socket);
                Ok(())
            }
            Ok(s) => Err(Error::ssh_connect_failed(
                &self.host_name,
                s.code().unwrap_or(-1),
                log,
            )),
            Err(e) => Err(Error::ssh_connect_failed(
                &self.host_name,
                -1,
                format!("SSH error: {}", e),
            )),
        }
    }

    /// Stop the control master, if one was started.
    pub fn close(&mut self) {
        let Some(socket) = self.control_path.take() else {
            return;
        };

        let _ = Command::new("ssh")
            .args([
                "-o".to_string(),
                format!("ControlPath={}", socket.display()),
                "-O".to_string(),
                "exit".to_string(),
                self.target.clone(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let _ = std::fs::remove_file(&socket);
    }

    fn base_args(&self, with_control_path: bool) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Non-interactive: fail instead of prompting, and give up on stalled
        // connections.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        if with_control_path {
            if let Some(socket) = &self.control_path {
                args.push("-o".to_string());
                args.push(format!("ControlPath={}", socket.display()));
            }
        }

        args
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.base_args(true);
        args.push(self.target.clone());
        args.push(command.to_string());
        args
    }

    pub fn execute(&self, command: &str) -> CommandOutput {
        self.execute_with_stdin(command, None)
    }

    /// Stream `local_path` into `remote_path`, replacing any existing file.
    pub fn upload_file(&self, local_path: &str, remote_path: &str) -> CommandOutput {
        let remote_command = format!("cat > {}", shell::quote_path(remote_path));
        self.execute_with_stdin(&remote_command, Some(local_path))
    }

    fn execute_with_stdin(&self, command: &str, stdin_file: Option<&str>) -> CommandOutput {
        self.execute_with_retry(command, stdin_file, self.options.max_attempts.max(1))
    }

    fn execute_with_retry(
        &self,
        command: &str,
        stdin_file: Option<&str>,
        max_attempts: u32,
    ) -> CommandOutput {
        let mut attempt = 0;
        loop {
            let result = self.execute_once(command, stdin_file);

            // Only retry on transient connection errors, not command failures
            if result.success
                || attempt + 1 >= max_attempts
                || self.is_local
                || !is_transient_ssh_error(&result)
            {
                return result;
            }

            let delay = retry_delay_secs(attempt);
            log_status!(
                "ssh",
                "Connection to '{}' failed (attempt {}/{}), retrying in {}s...",
                self.host_name,
                attempt + 1,
                max_attempts,
                delay
            );
            std::thread::sleep(std::time::Duration::from_secs(delay));
            attempt += 1;
        }
    }

    fn execute_once(&self, command: &str, stdin_file: Option<&str>) -> CommandOutput {
        if self.is_local {
            if let Some(stdin_file_path) = stdin_file {
                // For stdin piping (used by upload_file), use shell redirection
                let local_cmd = format!(
                    "cat {} | {}",
                    shell::quote_path(stdin_file_path),
                    command
                );
                return execute_local_command(&local_cmd);
            }
            return execute_local_command(command);
        }

        let mut cmd = Command::new("ssh");
        cmd.args(self.build_ssh_args(command));

        if let Some(stdin_file_path) = stdin_file {
            match std::fs::File::open(stdin_file_path) {
                Ok(file) => {
                    cmd.stdin(file);
                }
                Err(err) => {
                    return CommandOutput::failure(format!("Failed to open stdin file: {}", err));
                }
            }
        } else {
            cmd.stdin(Stdio::null());
        }

        match cmd.output() {
            Ok(out) => CommandOutput {
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                success: out.status.success(),
                exit_code: out.status.code().unwrap_or(-1),
            },
            Err(e) => CommandOutput::failure(format!("SSH error: {}", e)),
        }
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Backoff before each retry: 0s, 2s, then 5s for every later attempt.
const RETRY_DELAYS_SECS: [u64; 3] = [0, 2, 5];

fn retry_delay_secs(retry: u32) -> u64 {
    RETRY_DELAYS_SECS
        .get(retry as usize)
        .copied()
        .unwrap_or(RETRY_DELAYS_SECS[RETRY_DELAYS_SECS.len() - 1])
}

pub fn execute_local_command(command: &str) -> CommandOutput {
    execute_local_command_in_dir(command, None)
}

pub fn execute_local_command_in_dir(command: &str, current_dir: Option<&Path>) -> CommandOutput {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };

    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };

    if let Some(dir) = current_dir {
        cmd.current_dir(dir);
    }

    match cmd.stdin(Stdio::null()).output() {
        Ok(out) => CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            success: out.status.success(),
            exit_code: out.status.code().unwrap_or(-1),
        },
        Err(e) => CommandOutput::failure(format!("Command error: {}", e)),
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Check if an SSH failure is a transient connection error worth retrying.
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    // SSH exit code 255 = connection error (not a remote command failure)
    let is_connection_exit = output.exit_code == 255;

    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "could not resolve hostname",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by remote host",
    ];

    is_connection_exit || transient_patterns.iter().any(|p| stderr.contains(p))
}
