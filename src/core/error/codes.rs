use super::ErrorCode;

pub fn all_codes() -> &'static [ErrorCode] {
    &[
        ErrorCode::ConfigMissingKey,
        ErrorCode::ConfigInvalidFile,
        ErrorCode::ConfigInvalidValue,
        ErrorCode::ValidationInvalidArgument,
        ErrorCode::HostDuplicate,
        ErrorCode::HostNotFound,
        ErrorCode::TaskNotFound,
        ErrorCode::TaskCyclic,
        ErrorCode::SshIdentityFileNotFound,
        ErrorCode::SshConnectFailed,
        ErrorCode::RemoteCommandFailed,
        ErrorCode::RemoteTransferFailed,
        ErrorCode::RemoteHostLocked,
        ErrorCode::DeployAborted,
        ErrorCode::InternalIoError,
        ErrorCode::InternalJsonError,
        ErrorCode::InternalUnexpected,
    ]
}

pub fn parse_code(code: &str) -> Option<ErrorCode> {
    all_codes()
        .iter()
        .copied()
        .find(|candidate| candidate.as_str() == code)
}
