//! Remote execution seam: executors open sessions, sessions run commands
//! and upload files.
//!
//! A [`Connection`] owns its session and closes it on drop, so the remote
//! connection is released on every exit path.

use std::path::Path;

use crate::error::{Error, RemoteCommandFailedDetails, Result, TransferFailedDetails};
use crate::host::Host;
use crate::ssh::{SshClient, SshOptions};

/// An open channel to one host.
pub trait Session: Send {
    /// Run `command`; nonzero exit is `remote.command_failed`.
    fn run_command(&mut self, command: &str) -> Result<String>;

    /// Copy `local_path` to `remote_path`, overwriting it.
    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()>;

    fn close(&mut self);
}

/// Opens sessions. Holds no per-host state between calls.
pub trait RemoteExecutor: Send + Sync {
    fn open(&self, host: &Host) -> Result<Box<dyn Session>>;

    /// Scoped acquisition: the returned guard closes the session when dropped.
    fn connect(&self, host: &Host) -> Result<Connection> {
        Ok(Connection::new(host.name(), self.open(host)?))
    }
}

pub struct Connection {
    host: String,
    session: Option<Box<dyn Session>>,
}

impl Connection {
    pub fn new(host: impl Into<String>, session: Box<dyn Session>) -> Self {
        Self {
            host: host.into(),
            session: Some(session),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn session(&mut self) -> Result<&mut (dyn Session + 'static)> {
        match self.session.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(Error::internal_unexpected(format!(
                "Connection to '{}' is already closed",
                self.host
            ))),
        }
    }

    pub fn run_command(&mut self, command: &str) -> Result<String> {
        self.session()?.run_command(command)
    }

    pub fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        self.session()?.upload_file(local_path, remote_path)
    }

    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Executor over the system `ssh` binary. Hosts whose hostname is
/// localhost run through `sh -c` instead.
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

impl RemoteExecutor for SshExecutor {
    fn open(&self, host: &Host) -> Result<Box<dyn Session>> {
        let mut client = SshClient::from_host(host, &self.options)?;
        client.open()?;
        Ok(Box::new(SshSession { client }))
    }
}

pub struct SshSession {
    client: SshClient,
}

impl Session for SshSession {
    fn run_command(&mut self, command: &str) -> Result<String> {
        let output = self.client.execute(command);
        if output.success {
            return Ok(output.stdout);
        }

        Err(Error::remote_command_failed(RemoteCommandFailedDetails {
            command: command.to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            host: self.client.host_name.clone(),
        }))
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> Result<()> {
        let transfer_error = |error: String| {
            Error::remote_transfer_failed(TransferFailedDetails {
                local_path: local_path.display().to_string(),
                remote_path: remote_path.to_string(),
                host: self.client.host_name.clone(),
                error,
            })
        };

        if let Err(e) = std::fs::File::open(local_path) {
            return Err(transfer_error(e.to_string()));
        }

        let output = self
            .client
            .upload_file(&local_path.to_string_lossy(), remote_path);
        if output.success {
            return Ok(());
        }

        let error = if output.stderr.trim().is_empty() {
            format!("exit code {}", output.exit_code)
        } else {
            output.stderr
        };
        Err(transfer_error(error))
    }

    fn close(&mut self) {
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::host::{HostAttributes, HostRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn localhost(registry: &mut HostRegistry) -> &Host {
        let mut attrs = HostAttributes::new();
        attrs.insert("hostname".to_string(), json!("localhost"));
        registry.declare("local", attrs).unwrap()
    }

    struct CountingSession {
        closed: Arc<AtomicUsize>,
    }

    impl Session for CountingSession {
        fn run_command(&mut self, _command: &str) -> Result<String> {
            Err(Error::internal_unexpected("always fails"))
        }

        fn upload_file(&mut self, _local_path: &Path, _remote_path: &str) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn connection_closes_session_once_on_drop_after_failure() {
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let mut conn = Connection::new(
                "web",
                Box::new(CountingSession {
                    closed: Arc::clone(&closed),
                }),
            );
            assert!(conn.run_command("anything").is_err());
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_close_then_use_is_an_error() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut conn = Connection::new(
            "web",
            Box::new(CountingSession {
                closed: Arc::clone(&closed),
            }),
        );
        conn.close();
        assert!(conn.run_command("ls").is_err());
        drop(conn);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ssh_session_reports_nonzero_exit() {
        let mut registry = HostRegistry::new();
        let host = localhost(&mut registry);
        let mut conn = SshExecutor::default().connect(host).unwrap();

        assert_eq!(conn.run_command("printf ok").unwrap(), "ok");
        let err = conn.run_command("echo nope >&2; exit 7").unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
        assert_eq!(err.details["exitCode"], 7);
        assert_eq!(err.details["stderr"], "nope\n");
        assert_eq!(err.details["host"], "local");
    }

    #[test]
    fn ssh_session_upload_errors_are_transfer_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = HostRegistry::new();
        let host = localhost(&mut registry);
        let mut conn = SshExecutor::default().connect(host).unwrap();

        let missing = dir.path().join("missing.txt");
        let err = conn
            .upload_file(&missing, &dir.path().join("out").display().to_string())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteTransferFailed);

        let src = dir.path().join("src.txt");
        std::fs::write(&src, "payload").unwrap();
        let err = conn
            .upload_file(&src, "/nonexistent-dir/for/sure/out.txt")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteTransferFailed);
    }
}
