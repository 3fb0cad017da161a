use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidFile,
    ConfigInvalidValue,

    ValidationInvalidArgument,

    HostDuplicate,
    HostNotFound,

    TaskNotFound,
    TaskCyclic,

    SshIdentityFileNotFound,
    SshConnectFailed,

    RemoteCommandFailed,
    RemoteTransferFailed,
    RemoteHostLocked,

    DeployAborted,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidFile => "config.invalid_file",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::HostDuplicate => "host.duplicate",
            ErrorCode::HostNotFound => "host.not_found",

            ErrorCode::TaskNotFound => "task.not_found",
            ErrorCode::TaskCyclic => "task.cyclic",

            ErrorCode::SshIdentityFileNotFound => "ssh.identity_file_not_found",
            ErrorCode::SshConnectFailed => "ssh.connect_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteTransferFailed => "remote.transfer_failed",
            ErrorCode::RemoteHostLocked => "remote.host_locked",

            ErrorCode::DeployAborted => "deploy.aborted",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidFileDetails {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CyclicTaskDetails {
    pub task: String,
    pub path: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub host: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailedDetails {
    pub local_path: String,
    pub remote_path: String,
    pub host: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostLockedDetails {
    pub host: String,
    pub lock_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnectFailedDetails {
    pub host: String,
    pub exit_code: i32,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshIdentityFileNotFoundDetails {
    pub host: String,
    pub identity_file: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
            tried,
        });

        Self::new(ErrorCode::ValidationInvalidArgument, problem, details)
    }

    pub fn config_missing_key(key: impl Into<String>, host: Option<String>) -> Self {
        let key = key.into();
        let message = match &host {
            Some(host) => format!("Missing configuration key '{}' for host '{}'", key, host),
            None => format!("Missing configuration key '{}'", key),
        };
        let details = to_details(ConfigMissingKeyDetails {
            key: key.clone(),
            host,
        });

        Self::new(ErrorCode::ConfigMissingKey, message, details)
            .with_hint(format!("Set '{}' under `config:` or on the host", key))
    }

    pub fn config_invalid_file(path: impl Into<String>, error: impl Into<String>) -> Self {
        let path = path.into();
        let details = to_details(ConfigInvalidFileDetails {
            path: path.clone(),
            error: error.into(),
        });

        Self::new(
            ErrorCode::ConfigInvalidFile,
            format!("Invalid declaration file '{}'", path),
            details,
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.clone(),
        });

        Self::new(ErrorCode::ConfigInvalidValue, problem, details)
    }

    pub fn host_duplicate(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::HostDuplicate,
            format!("Host '{}' is already declared", name),
            to_details(NotFoundDetails {
                id: name,
                suggestions: Vec::new(),
            }),
        )
    }

    pub fn host_not_found(name: impl Into<String>, suggestions: Vec<String>) -> Self {
        let name = name.into();
        let err = Self::new(
            ErrorCode::HostNotFound,
            format!("Host '{}' is not declared", name),
            to_details(NotFoundDetails {
                id: name,
                suggestions: suggestions.clone(),
            }),
        );
        match suggestions.first() {
            Some(first) => err.with_hint(format!("Did you mean '{}'?", first)),
            None => err.with_hint("Run 'hoist hosts' to see declared hosts"),
        }
    }

    pub fn task_not_found(name: impl Into<String>, suggestions: Vec<String>) -> Self {
        let name = name.into();
        let err = Self::new(
            ErrorCode::TaskNotFound,
            format!("Task '{}' is not defined", name),
            to_details(NotFoundDetails {
                id: name,
                suggestions: suggestions.clone(),
            }),
        );
        match suggestions.first() {
            Some(first) => err.with_hint(format!("Did you mean '{}'?", first)),
            None => err.with_hint("Run 'hoist tasks' to see defined tasks"),
        }
    }

    pub fn task_cyclic(task: impl Into<String>, path: Vec<String>) -> Self {
        let task = task.into();
        let message = format!(
            "Task '{}' references itself: {}",
            task,
            path.join(" -> ")
        );
        Self::new(
            ErrorCode::TaskCyclic,
            message,
            to_details(CyclicTaskDetails { task, path }),
        )
    }

    pub fn ssh_identity_file_not_found(
        host: impl Into<String>,
        identity_file: impl Into<String>,
    ) -> Self {
        let details = to_details(SshIdentityFileNotFoundDetails {
            host: host.into(),
            identity_file: identity_file.into(),
        });

        Self::new(
            ErrorCode::SshIdentityFileNotFound,
            "SSH identity file not found",
            details,
        )
    }

    pub fn ssh_connect_failed(
        host: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let stderr = stderr.into();
        let message = format!("Could not connect to '{}': {}", host, stderr.trim());
        let mut err = Self::new(
            ErrorCode::SshConnectFailed,
            message,
            to_details(SshConnectFailedDetails {
                host,
                exit_code,
                stderr,
            }),
        );
        err.retryable = Some(true);
        err
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        let output = if details.stderr.trim().is_empty() {
            details.stdout.trim()
        } else {
            details.stderr.trim()
        };
        let message = if output.is_empty() {
            format!("Command exited with code {}", details.exit_code)
        } else {
            format!("Command exited with code {}: {}", details.exit_code, output)
        };

        Self::new(ErrorCode::RemoteCommandFailed, message, to_details(details))
    }

    pub fn remote_transfer_failed(details: TransferFailedDetails) -> Self {
        let message = format!(
            "Upload of '{}' to '{}' failed: {}",
            details.local_path,
            details.remote_path,
            details.error.trim()
        );

        Self::new(ErrorCode::RemoteTransferFailed, message, to_details(details))
    }

    pub fn remote_host_locked(
        host: impl Into<String>,
        lock_file: impl Into<String>,
        holder: Option<String>,
    ) -> Self {
        let host = host.into();
        let lock_file = lock_file.into();
        let message = format!("Deploy is locked on '{}'", host);
        Self::new(
            ErrorCode::RemoteHostLocked,
            message,
            to_details(HostLockedDetails {
                host: host.clone(),
                lock_file,
                holder,
            }),
        )
        .with_hint(format!(
            "If no other deploy is running, run 'hoist run deploy:unlock:force --host {}'",
            host
        ))
    }

    pub fn deploy_aborted(host: impl Into<String>) -> Self {
        let host = host.into();
        Self::new(
            ErrorCode::DeployAborted,
            format!("Deploy to '{}' was aborted", host),
            serde_json::json!({ "host": host }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalJsonErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }
}
