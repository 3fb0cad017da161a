//! The `{success, data?, error?}` envelope printed on stdout, and the exit
//! code for each error family.

use hoist::error::Hint;
use hoist::{Error, ErrorCode, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};

#[derive(Debug, Serialize)]
pub struct CliResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CliError>,
}

#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: String,
    pub message: String,
    pub details: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Hint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl From<&Error> for CliError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            details: err.details.clone(),
            hints: err.hints.clone(),
            retryable: err.retryable,
        }
    }
}

impl From<Result<Value>> for CliResponse {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(err) => Self {
                success: false,
                data: None,
                error: Some(CliError::from(&err)),
            },
        }
    }
}

/// Serialize a command's `(data, exit_code)` result. Errors take the exit
/// code of their family.
pub fn into_json_result<T: Serialize>(result: Result<(T, i32)>) -> (Result<Value>, i32) {
    match result {
        Ok((data, exit_code)) => match serde_json::to_value(data) {
            Ok(value) => (Ok(value), exit_code),
            Err(err) => (
                Err(Error::internal_json(
                    err.to_string(),
                    Some("serialize response".to_string()),
                )),
                1,
            ),
        },
        Err(err) => {
            let exit_code = exit_code_for_error(err.code);
            (Err(err), exit_code)
        }
    }
}

pub fn exit_code_for_error(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::ConfigMissingKey
        | ErrorCode::ConfigInvalidFile
        | ErrorCode::ConfigInvalidValue
        | ErrorCode::ValidationInvalidArgument
        | ErrorCode::HostDuplicate
        | ErrorCode::TaskCyclic => 2,

        ErrorCode::HostNotFound | ErrorCode::TaskNotFound => 4,

        ErrorCode::SshIdentityFileNotFound | ErrorCode::SshConnectFailed => 10,

        ErrorCode::RemoteCommandFailed
        | ErrorCode::RemoteTransferFailed
        | ErrorCode::RemoteHostLocked
        | ErrorCode::DeployAborted => 20,

        ErrorCode::InternalIoError
        | ErrorCode::InternalJsonError
        | ErrorCode::InternalUnexpected => 1,
    }
}

pub fn print_json_result(result: Result<Value>) -> Result<()> {
    let payload = serde_json::to_string_pretty(&CliResponse::from(result)).map_err(|e| {
        Error::internal_json(e.to_string(), Some("serialize response".to_string()))
    })?;

    match writeln!(io::stdout().lock(), "{}", payload) {
        Ok(()) => Ok(()),
        // Output piped into something that exited early.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(Error::internal_io(
            e.to_string(),
            Some("write stdout".to_string()),
        )),
    }
}
